// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write fork
//! OWNERS: @runtime
//! PUBLIC API: Process::fork, Process::sfork, ForkOutcome, ForkReport
//! INVARIANTS:
//!   - Only `PRESENT|USER` pages below `UTOP` are considered.
//!   - The exception stack page is never duplicated; the child always gets a
//!     fresh private one.
//!   - The child becomes runnable only after its address space and upcall
//!     are complete. A failed fork leaves it not runnable.

use exo_abi::layout::UTOP;
use exo_abi::{envx, AbiError, EnvId, EnvStatus, ExoFork, PteFlags, VirtAddr};
use log::{info, warn};

use crate::cow::handle_cow_fault;
use crate::duppage::{duppage, Sharing};
use crate::fatal::Fatal;
use crate::process::Process;
use crate::sys::Kernel;

/// Which side of a fork the caller is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Running in the creator; carries the new child's id.
    Parent(EnvId),
    /// Running in the newly created child.
    Child,
}

/// Summary of one completed fork, as seen by the parent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForkReport {
    /// Child created by the fork.
    pub child: Option<EnvId>,
    /// Pages now shared copy-on-write.
    pub cow_pages: usize,
    /// Read-only pages shared without COW.
    pub shared_pages: usize,
    /// Whether the exception stack was found in the walk (as opposed to
    /// allocated afterwards).
    pub xstack_in_walk: bool,
}

impl<K: Kernel> Process<K> {
    /// Duplicates the calling environment.
    ///
    /// Returns [`ForkOutcome::Parent`] with the child's id in the caller and
    /// [`ForkOutcome::Child`] when the child first runs. Every failure is
    /// fatal for the caller.
    pub fn fork(&mut self) -> Result<ForkOutcome, Fatal> {
        self.try_fork().map_err(|err| self.terminate(err))
    }

    /// Shared-memory fork. Not provided; always terminates the caller.
    pub fn sfork(&mut self) -> Result<ForkOutcome, Fatal> {
        Err(self.terminate(Fatal::Unsupported("sfork")))
    }

    fn try_fork(&mut self) -> Result<ForkOutcome, Fatal> {
        self.install_pgfault_handler(handle_cow_fault::<K>)?;

        match self.kernel.exofork().map_err(Fatal::kernel("exofork"))? {
            ExoFork::Child => {
                self.thisenv = envx(self.kernel.getenvid());
                Ok(ForkOutcome::Child)
            }
            ExoFork::Parent(child) => {
                let report = self.populate_child(child)?;
                info!(
                    target: "fork",
                    "forked {child}: {} cow, {} read-only shared",
                    report.cow_pages, report.shared_pages
                );
                self.last_report = Some(report);
                Ok(ForkOutcome::Parent(child))
            }
        }
    }

    fn populate_child(&self, child: EnvId) -> Result<ForkReport, Fatal> {
        let mut report = ForkReport { child: Some(child), ..ForkReport::default() };
        let xstack = VirtAddr::EXCEPTION_STACK;

        for (pn, pte) in self.kernel.mappings(VirtAddr::new(UTOP)) {
            if !pte.flags().is_user_mapped() {
                continue;
            }
            if pn.addr() == xstack {
                self.kernel
                    .page_alloc(child, xstack, PteFlags::USER_RW)
                    .map_err(Fatal::syscall("page_alloc", xstack))?;
                report.xstack_in_walk = true;
                continue;
            }
            match duppage(&self.kernel, child, pn)? {
                Sharing::CopyOnWrite => report.cow_pages += 1,
                Sharing::ReadOnly => report.shared_pages += 1,
            }
        }

        if !report.xstack_in_walk {
            warn!(target: "fork", "exception stack not mapped in parent; allocating for {child}");
            self.kernel
                .page_alloc(child, xstack, PteFlags::USER_RW)
                .map_err(Fatal::syscall("page_alloc", xstack))?;
        }

        let me = self
            .kernel
            .env(self.thisenv)
            .ok_or(Fatal::Kernel { op: "thisenv", source: AbiError::BadEnv })?;
        let entry = me.pgfault_upcall.ok_or(Fatal::BadUpcall { entry: VirtAddr::new(0) })?;
        self.kernel
            .env_set_pgfault_upcall(child, entry)
            .map_err(Fatal::kernel("env_set_pgfault_upcall"))?;
        self.kernel
            .env_set_status(child, EnvStatus::Runnable)
            .map_err(Fatal::kernel("env_set_status"))?;
        Ok(report)
    }
}
