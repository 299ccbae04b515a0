// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process exokernel model for host-based testing
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - HostMachine / HostConfig: frame pool, environment table, page tables
//!   - HostEnv: one environment's view; implements `Kernel`
//!   - Trap / KillReason: outcome of a faulting user access
//!   - Exit: why a host `Process` access did not complete
//!   - Process<HostEnv>::{read, write, read_u32, write_u32, resume_child}
//!
//! INVARIANTS:
//!   - Page faults are delivered to the registered upcall at most one level
//!     deep; a fault inside the upcall kills the environment.
//!   - An environment without an upcall or without a writable exception
//!     stack is killed on its first fault.
//!
//! DEPENDENCIES:
//!   - parking_lot::Mutex: shared machine state
//!   - log: per-syscall tracing under the "host" target

mod env;
mod machine;

pub use env::HostEnv;
pub use machine::{HostConfig, HostMachine};

use exo_abi::{EnvId, VirtAddr};
use thiserror::Error;

use crate::fatal::Fatal;
use crate::pgfault::FaultRecord;
use crate::process::Process;

/// Why the model refused to deliver a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum KillReason {
    /// No page-fault upcall registered.
    #[error("no page-fault upcall")]
    NoUpcall,
    /// Fault raised while the environment was already in its upcall.
    #[error("fault inside the page-fault upcall")]
    NestedFault,
    /// Exception stack missing or not writable.
    #[error("exception stack unusable")]
    NoExceptionStack,
}

/// Result of a user access that did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Trap {
    /// The kernel switched to the exception stack and jumped to `entry`.
    #[error("page fault at {record}, upcall {entry}")]
    Upcall {
        /// Upcall entry point.
        entry: VirtAddr,
        /// Fault information on the exception stack.
        record: FaultRecord,
    },
    /// The fault could not be delivered; the environment is gone.
    #[error("environment {env} killed on fault at {record}: {reason}")]
    Killed {
        /// Destroyed environment.
        env: EnvId,
        /// Why delivery failed.
        reason: KillReason,
        /// The undeliverable fault.
        record: FaultRecord,
    },
    /// The environment no longer exists.
    #[error("environment {env} is not running")]
    Dead {
        /// Environment the access was issued for.
        env: EnvId,
    },
}

/// Why a memory access through a host [`Process`] failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Exit {
    /// The runtime terminated the environment.
    #[error(transparent)]
    Fatal(#[from] Fatal),
    /// The model killed the environment or it was already gone.
    #[error(transparent)]
    Trap(Trap),
}

impl Process<HostEnv> {
    /// Runtime for the child `kernel` resumes, as it exists right after
    /// `exofork` returned in the parent.
    ///
    /// The child inherits the parent's handler state and its (stale) cached
    /// `thisenv`; calling [`Process::fork`] in the child refreshes it.
    pub fn resume_child(&self, kernel: HostEnv) -> Self {
        Self { kernel, thisenv: self.thisenv, pgfault: self.pgfault, last_report: None }
    }

    /// Reads `buf.len()` bytes at `va`, servicing page faults on the way.
    pub fn read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), Exit> {
        self.run(|kernel| kernel.load(va, buf))
    }

    /// Writes `bytes` at `va`, servicing page faults on the way.
    pub fn write(&self, va: VirtAddr, bytes: &[u8]) -> Result<(), Exit> {
        self.run(|kernel| kernel.store(va, bytes))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&self, va: VirtAddr) -> Result<u32, Exit> {
        let mut raw = [0u8; 4];
        self.read(va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&self, va: VirtAddr, value: u32) -> Result<(), Exit> {
        self.write(va, &value.to_le_bytes())
    }

    fn run(&self, mut access: impl FnMut(&HostEnv) -> Result<(), Trap>) -> Result<(), Exit> {
        let mut handled: Option<FaultRecord> = None;
        loop {
            match access(&self.kernel) {
                Ok(()) => return Ok(()),
                Err(Trap::Upcall { record, .. }) if handled == Some(record) => {
                    self.kernel.upcall_return();
                    let FaultRecord { va, code } = record;
                    return Err(self.terminate(Fatal::Unresolved { va, code }).into());
                }
                Err(Trap::Upcall { entry, record }) => {
                    let delivered = self.deliver(entry, &record);
                    self.kernel.upcall_return();
                    delivered?;
                    handled = Some(record);
                }
                Err(trap) => return Err(Exit::Trap(trap)),
            }
        }
    }
}
