// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault handler registration.
//!
//! INVARIANTS:
//!   - The exception stack page at `UXSTACKTOP - PGSIZE` is allocated once
//!     per environment, privately, and is never shared or marked COW.
//!   - The kernel always enters the runtime at `PGFAULT_UPCALL`; the stored
//!     handler decides what happens next.

use core::fmt;

use exo_abi::{EnvId, FaultCode, PteFlags, VirtAddr};
use log::debug;

use crate::fatal::Fatal;
use crate::process::Process;
use crate::sys::Kernel;

/// Fault information pushed onto the exception stack by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    /// Faulting virtual address.
    pub va: VirtAddr,
    /// Hardware error code.
    pub code: FaultCode,
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.va, self.code)
    }
}

/// User-level page-fault handler. Runs on the exception stack; returning
/// `Ok` resumes the faulting instruction.
pub type PgfaultHandler<K> = fn(&K, &FaultRecord) -> Result<(), Fatal>;

/// Per-process handler state.
pub struct PgfaultState<K> {
    handler: Option<PgfaultHandler<K>>,
    stack_ready: bool,
}

impl<K> PgfaultState<K> {
    pub(crate) const fn new() -> Self {
        Self { handler: None, stack_ready: false }
    }

    /// Currently installed handler.
    pub fn handler(&self) -> Option<PgfaultHandler<K>> {
        self.handler
    }

    /// Whether the exception stack and upcall have been set up.
    pub fn stack_ready(&self) -> bool {
        self.stack_ready
    }
}

impl<K> Clone for PgfaultState<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for PgfaultState<K> {}

impl<K> fmt::Debug for PgfaultState<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgfaultState")
            .field("installed", &self.handler.is_some())
            .field("stack_ready", &self.stack_ready)
            .finish()
    }
}

impl<K: Kernel> Process<K> {
    /// Installs `handler` as the user-level page-fault handler.
    ///
    /// The first call also allocates the exception stack and registers the
    /// runtime's upcall entry point with the kernel. Later calls only swap
    /// the handler. Failure terminates the environment.
    pub fn set_pgfault_handler(&mut self, handler: PgfaultHandler<K>) -> Result<(), Fatal> {
        self.install_pgfault_handler(handler).map_err(|err| self.terminate(err))
    }

    pub(crate) fn install_pgfault_handler(
        &mut self,
        handler: PgfaultHandler<K>,
    ) -> Result<(), Fatal> {
        if !self.pgfault.stack_ready {
            let xstack = VirtAddr::EXCEPTION_STACK;
            self.kernel
                .page_alloc(EnvId::SELF, xstack, PteFlags::USER_RW)
                .map_err(Fatal::syscall("page_alloc", xstack))?;
            self.kernel
                .env_set_pgfault_upcall(EnvId::SELF, VirtAddr::PGFAULT_UPCALL)
                .map_err(Fatal::kernel("env_set_pgfault_upcall"))?;
            self.pgfault.stack_ready = true;
            debug!(target: "pgfault", "exception stack at {xstack}, upcall {}", VirtAddr::PGFAULT_UPCALL);
        }
        self.pgfault.handler = Some(handler);
        Ok(())
    }

    /// Trampoline body: runs the installed handler for a fault the kernel
    /// delivered at `entry`.
    ///
    /// A foreign entry point, a missing handler or a handler error
    /// terminates the environment.
    pub fn deliver(&self, entry: VirtAddr, record: &FaultRecord) -> Result<(), Fatal> {
        let handler = match self.pgfault.handler {
            Some(handler) if entry == VirtAddr::PGFAULT_UPCALL => handler,
            _ => return Err(self.terminate(Fatal::BadUpcall { entry })),
        };
        handler(&self.kernel, record).map_err(|err| self.terminate(err))
    }
}
