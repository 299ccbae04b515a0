// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page duplication primitive used by fork.

use exo_abi::{EnvId, PageNum};
use log::debug;

use crate::fatal::Fatal;
use crate::sys::Kernel;

/// How a page ended up shared with the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sharing {
    /// Writable or already-COW page, now COW in both environments.
    CopyOnWrite,
    /// Read-only page, shared as is.
    ReadOnly,
}

/// Maps page `pn` of the caller into `child` at the same address.
///
/// Writable and COW pages are downgraded to COW, in the child first and then
/// in the caller. The child mapping therefore exists before the caller can
/// take a COW fault on the page: the caller's next write privatizes a copy
/// and the child keeps the original frame. Until the second mapping lands the
/// caller can still write the frame directly. Read-only pages keep their
/// permission.
pub fn duppage<K: Kernel>(kernel: &K, child: EnvId, pn: PageNum) -> Result<Sharing, Fatal> {
    let va = pn.addr();
    let flags = kernel.pte(pn).flags();
    let perm = flags.cow_shared();
    let sharing = if perm.is_cow() { Sharing::CopyOnWrite } else { Sharing::ReadOnly };

    kernel
        .page_map(EnvId::SELF, va, child, va, perm)
        .map_err(Fatal::syscall("page_map", va))?;
    kernel
        .page_map(EnvId::SELF, va, EnvId::SELF, va, perm)
        .map_err(Fatal::syscall("page_map", va))?;

    debug!(target: "fork", "dup {va} -> {child} {perm:?}");
    Ok(sharing)
}
