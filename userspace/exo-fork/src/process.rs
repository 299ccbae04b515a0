// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-environment runtime context.

use exo_abi::{envx, EnvId};
use log::error;

use crate::fatal::Fatal;
use crate::fork::ForkReport;
use crate::pgfault::PgfaultState;
use crate::sys::Kernel;

/// The user-level runtime of one environment.
///
/// Owns the handle to the kernel, the page-fault handler state and the cached
/// `thisenv` slot. A `Process` is single-threaded; the only re-entry is the
/// page-fault upcall.
pub struct Process<K> {
    pub(crate) kernel: K,
    pub(crate) thisenv: usize,
    pub(crate) pgfault: PgfaultState<K>,
    pub(crate) last_report: Option<ForkReport>,
}

impl<K: Kernel> Process<K> {
    /// Builds the runtime for the environment behind `kernel`.
    pub fn new(kernel: K) -> Self {
        let thisenv = envx(kernel.getenvid());
        Self { kernel, thisenv, pgfault: PgfaultState::new(), last_report: None }
    }

    /// Kernel handle of this environment.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Slot of this environment's control block in the environment table.
    pub fn thisenv(&self) -> usize {
        self.thisenv
    }

    /// Page-fault handler state.
    pub fn pgfault(&self) -> &PgfaultState<K> {
        &self.pgfault
    }

    /// Summary of the most recent successful fork in this process.
    pub fn last_fork_report(&self) -> Option<ForkReport> {
        self.last_report
    }

    /// Destroys the calling environment and hands `reason` back.
    ///
    /// On the OS the destroy call does not return.
    pub(crate) fn terminate(&self, reason: Fatal) -> Fatal {
        error!(target: "fork", "[{:08x}] fatal: {reason}", self.kernel.getenvid().as_raw());
        if let Err(err) = self.kernel.env_destroy(EnvId::SELF) {
            error!(target: "fork", "env_destroy failed: {err}");
        }
        reason
    }
}
