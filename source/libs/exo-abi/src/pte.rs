// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table entry encoding and fault error codes.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Flags stored in the low 12 bits of a page-table entry.
    pub struct PteFlags: u32 {
        /// Mapping is valid.
        const PRESENT = 1 << 0;
        /// Writes allowed.
        const WRITABLE = 1 << 1;
        /// Accessible from user mode.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED = 1 << 5;
        /// Set by hardware on write.
        const DIRTY = 1 << 6;
        /// Large page (directory entries only).
        const HUGE = 1 << 7;
        /// Kept across address-space switches.
        const GLOBAL = 1 << 8;
        /// First bit reserved for user-defined meaning.
        const AVAIL0 = 1 << 9;
        /// Second bit reserved for user-defined meaning.
        const AVAIL1 = 1 << 10;
        /// Copy-on-write marker; the third user-defined bit.
        const COW = 1 << 11;
    }
}

impl PteFlags {
    /// All bits the kernel leaves to userland.
    pub const AVAIL: Self = Self::AVAIL0.union(Self::AVAIL1).union(Self::COW);

    /// The only flags a syscall may carry across the privilege boundary.
    pub const SYSCALL: Self = Self::AVAIL
        .union(Self::PRESENT)
        .union(Self::WRITABLE)
        .union(Self::USER);

    /// Flags every user mapping installed through a syscall must carry.
    pub const USER_PRESENT: Self = Self::PRESENT.union(Self::USER);

    /// Default permission for a private, writable user page.
    pub const USER_RW: Self = Self::USER_PRESENT.union(Self::WRITABLE);

    /// Drops every bit outside [`PteFlags::SYSCALL`].
    #[must_use]
    pub const fn exportable(self) -> Self {
        self.intersection(Self::SYSCALL)
    }

    /// Returns `true` when the entry is marked copy-on-write.
    pub const fn is_cow(self) -> bool {
        self.contains(Self::COW)
    }

    /// Returns `true` for a present, user-accessible entry.
    pub const fn is_user_mapped(self) -> bool {
        self.contains(Self::USER_PRESENT)
    }

    /// Permission used when sharing a page between two address spaces.
    ///
    /// Pages that are writable or already copy-on-write lose `WRITABLE` and
    /// gain `COW`. Read-only pages are shared as they are.
    #[must_use]
    pub const fn cow_shared(self) -> Self {
        let shared = if self.contains(Self::WRITABLE) || self.contains(Self::COW) {
            self.difference(Self::WRITABLE).union(Self::COW)
        } else {
            self
        };
        shared.exportable()
    }

    /// Permission of a page after it has been privatized by the fault handler.
    #[must_use]
    pub const fn privatized(self) -> Self {
        self.difference(Self::COW).union(Self::WRITABLE).exportable()
    }

    /// Returns `true` when the kernel accepts `self` as a syscall permission.
    pub const fn is_valid_syscall_perm(self) -> bool {
        self.contains(Self::USER_PRESENT) && Self::SYSCALL.contains(self)
    }
}

/// Mask covering the flag portion of an entry.
pub const PTE_FLAGS_MASK: u32 = 0xfff;

/// Raw 32-bit page-table entry: frame number in bits 31..12, flags below.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    /// The all-zero, non-present entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry pointing at physical frame number `frame`.
    pub const fn new(frame: u32, flags: PteFlags) -> Self {
        Self((frame << 12) | (flags.bits() & PTE_FLAGS_MASK))
    }

    /// Wraps a raw entry read from the page-table self-map.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw entry.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Physical frame number referenced by the entry.
    pub const fn frame(self) -> u32 {
        self.0 >> 12
    }

    /// Flag bits of the entry.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PTE_FLAGS_MASK)
    }

    /// Returns `true` when the entry has `PRESENT` set.
    pub const fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pte").field("frame", &self.frame()).field("flags", &self.flags()).finish()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Error code pushed with a page fault.
    pub struct FaultCode: u32 {
        /// The page was present; the fault is a protection violation.
        const PROTECTION = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The fault happened in user mode.
        const USER = 1 << 2;
    }
}

impl FaultCode {
    /// Returns `true` when the faulting access was a write.
    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}
