// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User virtual memory layout and address newtypes
//! INVARIANTS: Two-level paging, 4 KiB pages, 32-bit virtual addresses;
//!             nothing at or above `UTOP` is managed from userland.
//!
//! ```text
//!  UVPT       0xef40_0000  read-only self-map of the page tables
//!  UTOP       0xeec0_0000  = UXSTACKTOP
//!             0xeebf_f000  exception stack page (one page)
//!             0xeebf_e000  empty guard page
//!  USTACKTOP  0xeebf_e000  normal user stack grows down from here
//!  ...
//!  UTEXT      0x0080_0000  program text
//!  PFTEMP     0x007f_f000  scratch page for the COW fault handler
//!  UTEMP      0x0040_0000
//! ```

use core::fmt;
use core::ops::Add;

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Size of a page in bytes.
pub const PGSIZE: u32 = 4096;
/// log2(PGSIZE).
pub const PGSHIFT: u32 = 12;
/// Entries per page directory.
pub const NPDENTRIES: u32 = 1024;
/// Entries per page table.
pub const NPTENTRIES: u32 = 1024;
/// Bytes mapped by one page-directory entry.
pub const PTSIZE: u32 = PGSIZE * NPTENTRIES;
/// log2(PTSIZE).
pub const PDXSHIFT: u32 = 22;

/// Read-only self-map of the current page tables.
pub const UVPT: u32 = 0xef40_0000;
/// Read-only view of the environment table.
pub const UENVS: u32 = UVPT - 2 * PTSIZE;
/// Top of user-manageable memory.
pub const UTOP: u32 = UENVS;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack; one guard page below the exception stack.
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE;
/// Where user programs are linked.
pub const UTEXT: u32 = 2 * PTSIZE;
/// Scratch region for temporary mappings.
pub const UTEMP: u32 = PTSIZE;
/// Temporary page used by the fault handler while privatizing a page.
pub const PFTEMP: u32 = UTEMP + PTSIZE - PGSIZE;
/// Entry point of the user-level page-fault trampoline in the runtime text.
pub const PGFAULT_UPCALL: u32 = UTEXT + 0x20;

const_assert_eq!(UTOP, 0xeec0_0000);
const_assert!(UTOP % PTSIZE == 0);
const_assert!(PFTEMP < UTEXT);
const_assert!(PGFAULT_UPCALL < UTOP);

/// Page-directory index of `va`.
#[inline]
pub const fn pdx(va: u32) -> u32 {
    va >> PDXSHIFT
}

/// Page-table index of `va`.
#[inline]
pub const fn ptx(va: u32) -> u32 {
    (va >> PGSHIFT) & (NPTENTRIES - 1)
}

/// A user virtual address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Address of the exception stack page.
    pub const EXCEPTION_STACK: Self = Self(UXSTACKTOP - PGSIZE);
    /// Scratch page used by the fault handler.
    pub const PFTEMP: Self = Self(PFTEMP);
    /// Address of the page-fault trampoline.
    pub const PGFAULT_UPCALL: Self = Self(PGFAULT_UPCALL);

    /// Wraps a raw address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Returns `Some` only for page-aligned addresses.
    #[inline]
    pub const fn page_aligned(addr: u32) -> Option<Self> {
        if addr % PGSIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Raw address.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Rounds down to the containing page.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !(PGSIZE - 1))
    }

    /// Byte offset within the page.
    #[inline]
    pub const fn page_offset(self) -> u32 {
        self.0 & (PGSIZE - 1)
    }

    /// Page number containing this address.
    #[inline]
    pub const fn page(self) -> PageNum {
        PageNum(self.0 >> PGSHIFT)
    }

    /// Returns `true` when the address starts a page.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }

    /// Returns `true` for addresses userland may map and unmap.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < UTOP
    }
}

impl Add<u32> for VirtAddr {
    type Output = Self;

    fn add(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Virtual page number (`va >> PGSHIFT`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNum(u32);

impl PageNum {
    /// Wraps a raw page number.
    #[inline]
    pub const fn new(pn: u32) -> Self {
        Self(pn)
    }

    /// Page number of entry `ptx` inside directory group `pdx`.
    #[inline]
    pub const fn from_indices(pdx: u32, ptx: u32) -> Self {
        Self(pdx * NPTENTRIES + ptx)
    }

    /// Raw page number.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// First address of the page.
    #[inline]
    pub const fn addr(self) -> VirtAddr {
        VirtAddr(self.0 << PGSHIFT)
    }

    /// Page-directory index.
    #[inline]
    pub const fn pdx(self) -> u32 {
        self.0 / NPTENTRIES
    }

    /// Page-table index.
    #[inline]
    pub const fn ptx(self) -> u32 {
        self.0 % NPTENTRIES
    }
}
