// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Call-recording kernel for unit tests.

use std::cell::RefCell;
use std::collections::BTreeMap;

use exo_abi::{EnvId, EnvStatus, ExoFork, PageNum, Pte, PteFlags, SysResult, VirtAddr};

use crate::sys::{EnvInfo, EnvTable, PageTableView, Syscalls, UserMemory};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Alloc(EnvId, VirtAddr, PteFlags),
    Map(EnvId, VirtAddr, EnvId, VirtAddr, PteFlags),
    Unmap(EnvId, VirtAddr),
    Copy(VirtAddr, VirtAddr),
    Destroy(EnvId),
}

#[derive(Default)]
pub(crate) struct Recorder {
    pub(crate) ptes: BTreeMap<u32, Pte>,
    pub(crate) calls: RefCell<Vec<Call>>,
}

impl Recorder {
    pub(crate) fn with_page(va: VirtAddr, flags: PteFlags) -> Self {
        let mut rec = Self::default();
        rec.ptes.insert(va.page().raw(), Pte::new(42, flags));
        rec
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: Call) -> SysResult<()> {
        self.calls.borrow_mut().push(call);
        Ok(())
    }
}

impl Syscalls for Recorder {
    fn exofork(&self) -> SysResult<ExoFork> {
        Ok(ExoFork::Parent(EnvId::from_raw(0x1001)))
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()> {
        self.record(Call::Alloc(env, va, perm))
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.record(Call::Map(src_env, src_va, dst_env, dst_va, perm))
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()> {
        self.record(Call::Unmap(env, va))
    }

    fn env_set_pgfault_upcall(&self, _env: EnvId, _entry: VirtAddr) -> SysResult<()> {
        Ok(())
    }

    fn env_set_status(&self, _env: EnvId, _status: EnvStatus) -> SysResult<()> {
        Ok(())
    }

    fn getenvid(&self) -> EnvId {
        EnvId::from_raw(0x1000)
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        self.record(Call::Destroy(env))
    }
}

impl PageTableView for Recorder {
    fn pde(&self, pdx: u32) -> Pte {
        if self.ptes.keys().any(|pn| PageNum::new(*pn).pdx() == pdx) {
            Pte::new(0, PteFlags::USER_RW)
        } else {
            Pte::EMPTY
        }
    }

    fn pte(&self, pn: PageNum) -> Pte {
        self.ptes.get(&pn.raw()).copied().unwrap_or(Pte::EMPTY)
    }
}

impl EnvTable for Recorder {
    fn env(&self, _slot: usize) -> Option<EnvInfo> {
        None
    }
}

impl UserMemory for Recorder {
    fn copy_page(&self, dst: VirtAddr, src: VirtAddr) -> SysResult<()> {
        self.record(Call::Copy(dst, src))
    }
}
