// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Unrecoverable failures of the fork runtime.

use exo_abi::{AbiError, FaultCode, PteFlags, VirtAddr};
use thiserror::Error;

/// Reason an environment is terminated by the fork runtime.
///
/// None of these are retried. The public entry points of
/// [`Process`](crate::Process) destroy the calling environment before the
/// value is handed back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Fatal {
    /// A page-level syscall failed.
    #[error("{op} at {va} failed: {source}")]
    Syscall {
        /// Operation name.
        op: &'static str,
        /// Page the operation targeted.
        va: VirtAddr,
        /// Kernel error.
        source: AbiError,
    },
    /// An environment-level syscall failed.
    #[error("{op} failed: {source}")]
    Kernel {
        /// Operation name.
        op: &'static str,
        /// Kernel error.
        source: AbiError,
    },
    /// The fault handler saw something other than a write to a COW page.
    #[error("unexpected page fault at {va} (code {code:?}, pte {flags:?})")]
    NotCowWrite {
        /// Faulting address.
        va: VirtAddr,
        /// Hardware error code.
        code: FaultCode,
        /// Flags of the faulting page at the time of the fault.
        flags: PteFlags,
    },
    /// A fault was delivered to an entry point the runtime does not own, or
    /// no handler is installed.
    #[error("no page-fault handler behind upcall {entry}")]
    BadUpcall {
        /// Entry point the kernel jumped to.
        entry: VirtAddr,
    },
    /// The handler returned but the same access faulted again.
    #[error("page fault at {va} ({code:?}) persisted after the handler returned")]
    Unresolved {
        /// Faulting address.
        va: VirtAddr,
        /// Hardware error code.
        code: FaultCode,
    },
    /// Operation not provided by this runtime.
    #[error("{0} is not supported")]
    Unsupported(&'static str),
}

impl Fatal {
    pub(crate) fn syscall(op: &'static str, va: VirtAddr) -> impl FnOnce(AbiError) -> Self {
        move |source| Self::Syscall { op, va, source }
    }

    pub(crate) fn kernel(op: &'static str) -> impl FnOnce(AbiError) -> Self {
        move |source| Self::Kernel { op, source }
    }
}
