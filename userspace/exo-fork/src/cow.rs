// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fault handler.

use exo_abi::{EnvId, PteFlags, VirtAddr};
use log::debug;

use crate::fatal::Fatal;
use crate::pgfault::FaultRecord;
use crate::sys::Kernel;

/// Privatizes the COW page behind a write fault.
///
/// Anything other than a write to a page marked COW is a protocol violation
/// and is returned as [`Fatal::NotCowWrite`]. On success the faulting page is
/// a private, writable, byte-identical copy and `PFTEMP` is unmapped again.
pub fn handle_cow_fault<K: Kernel>(kernel: &K, record: &FaultRecord) -> Result<(), Fatal> {
    let page = record.va.page_down();
    let flags = kernel.lookup(page).map(|pte| pte.flags()).unwrap_or(PteFlags::empty());
    if !record.code.is_write() || !flags.is_cow() {
        return Err(Fatal::NotCowWrite { va: record.va, code: record.code, flags });
    }

    let perm = flags.privatized();
    let scratch = VirtAddr::PFTEMP;
    kernel
        .page_alloc(EnvId::SELF, scratch, perm)
        .map_err(Fatal::syscall("page_alloc", scratch))?;
    kernel.copy_page(scratch, page).map_err(Fatal::syscall("copy_page", page))?;
    kernel
        .page_map(EnvId::SELF, scratch, EnvId::SELF, page, perm)
        .map_err(Fatal::syscall("page_map", page))?;
    kernel.page_unmap(EnvId::SELF, scratch).map_err(Fatal::syscall("page_unmap", scratch))?;

    debug!(target: "cow", "privatized {page} ({perm:?})");
    Ok(())
}
