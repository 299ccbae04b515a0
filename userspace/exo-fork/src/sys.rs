// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel surface consumed by the fork runtime.
//!
//! Everything the library needs from the exokernel is expressed as four
//! traits so the same fork logic runs against the real trap interface and
//! against the in-process [`host`](crate::host) model.

use exo_abi::{
    EnvId, EnvStatus, ExoFork, PageNum, Pte, PteFlags, SysResult, VirtAddr,
};

use crate::vpt::Mappings;

/// Privileged operations, one method per syscall.
///
/// `EnvId::SELF` designates the caller wherever an environment is expected.
pub trait Syscalls {
    /// Creates a blank, not-runnable child. Resumes as [`ExoFork::Child`]
    /// when the child first runs.
    fn exofork(&self) -> SysResult<ExoFork>;

    /// Allocates a zero-filled frame and maps it at `va` in `env`,
    /// replacing any existing mapping.
    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()>;

    /// Maps the frame behind `src_va` in `src_env` at `dst_va` in `dst_env`,
    /// replacing any existing mapping at the destination.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()>;

    /// Removes the mapping at `va` in `env`. Absent mappings are not an error.
    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()>;

    /// Registers the page-fault upcall entry point of `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, entry: VirtAddr) -> SysResult<()>;

    /// Sets `env` to `Runnable` or `NotRunnable`.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()>;

    /// Id of the calling environment.
    fn getenvid(&self) -> EnvId;

    /// Destroys `env`. Destroying `EnvId::SELF` on the OS never returns.
    fn env_destroy(&self, env: EnvId) -> SysResult<()>;
}

/// Read-only view of the caller's two-level page table (the `UVPT` self-map).
pub trait PageTableView {
    /// Page-directory entry `pdx`.
    fn pde(&self, pdx: u32) -> Pte;

    /// Page-table entry for `pn`. Only meaningful when the covering
    /// directory entry is present.
    fn pte(&self, pn: PageNum) -> Pte;

    /// Entry mapping `va`, if both levels are present.
    fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        let pn = va.page();
        if !self.pde(pn.pdx()).is_present() {
            return None;
        }
        Some(self.pte(pn)).filter(|pte| pte.is_present())
    }

    /// Present entries below `limit`, skipping absent directory groups.
    fn mappings(&self, limit: VirtAddr) -> Mappings<'_, Self>
    where
        Self: Sized,
    {
        Mappings::new(self, limit)
    }
}

/// Snapshot of one environment control block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvInfo {
    /// Environment id.
    pub id: EnvId,
    /// Id of the creator, `EnvId::SELF` (0) for root environments.
    pub parent: EnvId,
    /// Scheduling status.
    pub status: EnvStatus,
    /// Registered page-fault upcall.
    pub pgfault_upcall: Option<VirtAddr>,
}

/// Read-only view of the kernel's environment table (`UENVS`).
pub trait EnvTable {
    /// Control block in `slot`, `None` for free slots.
    fn env(&self, slot: usize) -> Option<EnvInfo>;
}

/// Plain user-memory access.
pub trait UserMemory {
    /// Copies one page from `src` to `dst`; both must be mapped in the caller.
    fn copy_page(&self, dst: VirtAddr, src: VirtAddr) -> SysResult<()>;
}

/// Everything the fork runtime needs from the kernel.
pub trait Kernel: Syscalls + PageTableView + EnvTable + UserMemory {}

impl<T> Kernel for T where T: Syscalls + PageTableView + EnvTable + UserMemory {}
