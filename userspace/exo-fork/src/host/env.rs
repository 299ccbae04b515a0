// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The host machine as seen from inside one environment.

use exo_abi::{EnvId, EnvStatus, ExoFork, PageNum, Pte, PteFlags, SysResult, VirtAddr};

use super::machine::HostMachine;
use super::Trap;
use crate::sys::{EnvInfo, EnvTable, PageTableView, Syscalls, UserMemory};

/// Kernel handle of one environment on a [`HostMachine`].
#[derive(Clone)]
pub struct HostEnv {
    machine: HostMachine,
    id: EnvId,
}

impl HostEnv {
    pub(crate) fn new(machine: HostMachine, id: EnvId) -> Self {
        Self { machine, id }
    }

    /// Id of the environment this handle runs as.
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Machine the environment lives on.
    pub fn machine(&self) -> &HostMachine {
        &self.machine
    }

    /// Reads `buf.len()` bytes at `va`.
    pub fn load(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), Trap> {
        self.machine.with(|state| state.load(self.id, va, buf))
    }

    /// Writes `bytes` at `va`.
    pub fn store(&self, va: VirtAddr, bytes: &[u8]) -> Result<(), Trap> {
        self.machine.with(|state| state.store(self.id, va, bytes))
    }

    /// Leaves the page-fault upcall and resumes normal execution.
    pub fn upcall_return(&self) {
        self.machine.with(|state| state.upcall_return(self.id))
    }
}

impl Syscalls for HostEnv {
    fn exofork(&self) -> SysResult<ExoFork> {
        self.machine.with(|state| {
            if state.take_child_return(self.id)? {
                return Ok(ExoFork::Child);
            }
            state.exofork(self.id).map(ExoFork::Parent)
        })
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()> {
        self.machine.with(|state| state.page_alloc(self.id, env, va, perm))
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.machine.with(|state| state.page_map(self.id, src_env, src_va, dst_env, dst_va, perm))
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()> {
        self.machine.with(|state| state.page_unmap(self.id, env, va))
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: VirtAddr) -> SysResult<()> {
        self.machine.with(|state| state.set_upcall(self.id, env, entry))
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        self.machine.with(|state| state.set_status(self.id, env, status))
    }

    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        self.machine.with(|state| state.destroy(self.id, env))
    }
}

impl PageTableView for HostEnv {
    fn pde(&self, pdx: u32) -> Pte {
        self.machine.with(|state| state.pde(self.id, pdx))
    }

    fn pte(&self, pn: PageNum) -> Pte {
        self.machine.with(|state| state.pte(self.id, pn))
    }
}

impl EnvTable for HostEnv {
    fn env(&self, slot: usize) -> Option<EnvInfo> {
        self.machine.with(|state| state.env_info(slot))
    }
}

impl UserMemory for HostEnv {
    fn copy_page(&self, dst: VirtAddr, src: VirtAddr) -> SysResult<()> {
        self.machine.with(|state| state.copy_page(self.id, dst, src))
    }
}
