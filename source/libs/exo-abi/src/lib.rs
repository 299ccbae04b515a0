// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Exokernel ABI shared by the kernel and userland crates
//! OWNERS: @runtime
//! PUBLIC API: EnvId, EnvStatus, ExoFork, AbiError, errno, PteFlags, Pte, FaultCode, layout::*
//! DEPENDS_ON: no_std, bitflags, static_assertions
//! INVARIANTS: Syscall permissions never carry bits outside `PteFlags::SYSCALL`;
//!             negative syscall return values decode to `AbiError`.

use core::fmt;

pub mod layout;
mod pte;

pub use layout::{PageNum, VirtAddr};
pub use pte::{FaultCode, Pte, PteFlags, PTE_FLAGS_MASK};

/// Result returned by privileged syscalls.
pub type SysResult<T> = core::result::Result<T, AbiError>;

/// log2 of the number of environment slots.
pub const LOG2NENV: u32 = 10;
/// Number of environment slots in the kernel table.
pub const NENV: usize = 1 << LOG2NENV;
/// Shift applied to the generation counter inside an [`EnvId`].
pub const ENVGENSHIFT: u32 = 12;

/// Environment slot index encoded in `id`.
#[inline]
pub const fn envx(id: EnvId) -> usize {
    (id.as_raw() as usize) & (NENV - 1)
}

/// Opaque environment identifier.
///
/// The low [`LOG2NENV`] bits select the slot in the environment table; the
/// remaining bits form a generation counter so stale ids are rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Refers to the calling environment in every syscall.
    pub const SELF: Self = Self(0);

    /// Wraps a raw id as returned by the kernel.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id passed to the kernel.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns `true` for [`EnvId::SELF`].
    #[inline]
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }

    /// Slot index in the environment table.
    #[inline]
    pub const fn slot(self) -> usize {
        envx(self)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of an environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    /// Slot unused.
    Free = 0,
    /// Being torn down.
    Dying = 1,
    /// Waiting to be scheduled.
    Runnable = 2,
    /// Currently executing.
    Running = 3,
    /// Exists but must not be scheduled.
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decodes a raw status word.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// Outcome of the exofork syscall: the call resumes once in each environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExoFork {
    /// Returned to the creator together with the new environment's id.
    Parent(EnvId),
    /// Returned inside the new environment when it first runs.
    Child,
}

impl ExoFork {
    /// Decodes the non-negative return value of the exofork trap.
    pub const fn from_raw(raw: u32) -> Self {
        if raw == 0 {
            Self::Child
        } else {
            Self::Parent(EnvId::from_raw(raw))
        }
    }
}

/// Kernel error numbers (returned negated).
pub mod errno {
    /// Unspecified or unknown problem.
    pub const E_UNSPECIFIED: i32 = 1;
    /// Environment doesn't exist or otherwise cannot be used.
    pub const E_BAD_ENV: i32 = 2;
    /// Invalid parameter.
    pub const E_INVAL: i32 = 3;
    /// Request failed due to memory shortage.
    pub const E_NO_MEM: i32 = 4;
    /// Attempt to create a new environment beyond the maximum allowed.
    pub const E_NO_FREE_ENV: i32 = 5;
    /// Memory fault.
    pub const E_FAULT: i32 = 6;
}

/// Errors surfaced by privileged syscalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiError {
    /// Unknown failure.
    Unspecified,
    /// Target environment does not exist or the caller lacks permission over it.
    BadEnv,
    /// Bad permission bits, misaligned or out-of-range address, or unmapped source page.
    Inval,
    /// No physical frame (or page-table page) available.
    NoMem,
    /// Environment table is full.
    NoFreeEnv,
    /// Memory fault while accessing syscall arguments.
    Fault,
    /// Operation unsupported on the current build target.
    Unsupported,
}

impl AbiError {
    /// Decodes a raw syscall return value; non-negative values are successes.
    pub const fn from_raw(value: i32) -> Option<Self> {
        if value >= 0 {
            return None;
        }
        Some(match -value {
            errno::E_BAD_ENV => Self::BadEnv,
            errno::E_INVAL => Self::Inval,
            errno::E_NO_MEM => Self::NoMem,
            errno::E_NO_FREE_ENV => Self::NoFreeEnv,
            errno::E_FAULT => Self::Fault,
            _ => Self::Unspecified,
        })
    }

    /// Encodes the error as the negative value the kernel returns.
    pub const fn to_raw(self) -> i32 {
        -match self {
            Self::Unspecified | Self::Unsupported => errno::E_UNSPECIFIED,
            Self::BadEnv => errno::E_BAD_ENV,
            Self::Inval => errno::E_INVAL,
            Self::NoMem => errno::E_NO_MEM,
            Self::NoFreeEnv => errno::E_NO_FREE_ENV,
            Self::Fault => errno::E_FAULT,
        }
    }
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Unspecified => "unspecified error",
            Self::BadEnv => "bad environment",
            Self::Inval => "invalid parameter",
            Self::NoMem => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::Fault => "segmentation fault",
            Self::Unsupported => "unsupported on this target",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for AbiError {}
