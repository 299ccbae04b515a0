// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel state of the host model: frames, environments, page tables.
//!
//! Argument checking follows the exokernel's syscall layer. Anything a real
//! kernel would do beyond that (scheduling, trap frames, page-table frames)
//! is left out.

use std::collections::BTreeMap;
use std::sync::Arc;

use exo_abi::layout::{NPTENTRIES, PGSIZE};
use exo_abi::{
    envx, AbiError, EnvId, EnvStatus, FaultCode, PageNum, Pte, PteFlags, SysResult, VirtAddr,
    ENVGENSHIFT, NENV,
};
use log::{debug, warn};
use parking_lot::Mutex;

use super::env::HostEnv;
use super::{KillReason, Trap};
use crate::pgfault::FaultRecord;
use crate::sys::EnvInfo;

/// Sizing of a [`HostMachine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// Number of physical frames in the pool.
    pub frames: usize,
    /// Number of environment slots (at most `NENV`).
    pub max_envs: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { frames: 1024, max_envs: 64 }
    }
}

struct Frame {
    bytes: Box<[u8]>,
    refs: u32,
}

#[derive(Default)]
struct AddressSpace {
    tables: BTreeMap<u32, Box<[Pte]>>,
}

impl AddressSpace {
    fn pde(&self, pdx: u32) -> Pte {
        if self.tables.contains_key(&pdx) {
            Pte::new(0, PteFlags::USER_RW)
        } else {
            Pte::EMPTY
        }
    }

    fn get(&self, pn: PageNum) -> Pte {
        self.tables.get(&pn.pdx()).map_or(Pte::EMPTY, |table| table[pn.ptx() as usize])
    }

    fn set(&mut self, pn: PageNum, pte: Pte) {
        let table = self
            .tables
            .entry(pn.pdx())
            .or_insert_with(|| vec![Pte::EMPTY; NPTENTRIES as usize].into_boxed_slice());
        table[pn.ptx() as usize] = pte;
    }

    fn present(&self) -> Vec<(PageNum, Pte)> {
        self.tables
            .iter()
            .flat_map(|(&pdx, table)| {
                table
                    .iter()
                    .enumerate()
                    .filter(|(_, pte)| pte.is_present())
                    .map(move |(ptx, pte)| (PageNum::from_indices(pdx, ptx as u32), *pte))
            })
            .collect()
    }
}

struct EnvSlot {
    id: EnvId,
    parent: EnvId,
    status: EnvStatus,
    upcall: Option<VirtAddr>,
    space: AddressSpace,
    in_upcall: bool,
    resume_as_child: bool,
}

impl EnvSlot {
    fn free() -> Self {
        Self {
            id: EnvId::SELF,
            parent: EnvId::SELF,
            status: EnvStatus::Free,
            upcall: None,
            space: AddressSpace::default(),
            in_upcall: false,
            resume_as_child: false,
        }
    }
}

pub(crate) struct State {
    frames: Vec<Frame>,
    free_frames: Vec<u32>,
    envs: Vec<EnvSlot>,
}

impl State {
    fn new(config: HostConfig) -> Self {
        let frames = (0..config.frames)
            .map(|_| Frame { bytes: vec![0; PGSIZE as usize].into_boxed_slice(), refs: 0 })
            .collect();
        // Popped from the back, so low frame numbers are handed out first.
        let free_frames = (0..config.frames as u32).rev().collect();
        let envs = (0..config.max_envs.min(NENV)).map(|_| EnvSlot::free()).collect();
        Self { frames, free_frames, envs }
    }

    // ——— environments ———

    fn live_slot(&self, id: EnvId) -> SysResult<usize> {
        let slot = envx(id);
        match self.envs.get(slot) {
            Some(env) if env.status != EnvStatus::Free && env.id == id => Ok(slot),
            _ => Err(AbiError::BadEnv),
        }
    }

    /// Resolves `target` on behalf of `caller`. With `checkperm`, only the
    /// caller itself or one of its direct children is accepted.
    fn resolve(&self, caller: EnvId, target: EnvId, checkperm: bool) -> SysResult<usize> {
        let me = self.live_slot(caller)?;
        if target.is_self() {
            return Ok(me);
        }
        let slot = self.live_slot(target)?;
        if checkperm && slot != me && self.envs[slot].parent != caller {
            return Err(AbiError::BadEnv);
        }
        Ok(slot)
    }

    fn alloc_env(&mut self, parent: EnvId) -> SysResult<EnvId> {
        let slot = self
            .envs
            .iter()
            .position(|env| env.status == EnvStatus::Free)
            .ok_or(AbiError::NoFreeEnv)?;
        let env = &mut self.envs[slot];
        let mut generation =
            env.id.as_raw().wrapping_add(1 << ENVGENSHIFT) & !(NENV as u32 - 1);
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        let id = EnvId::from_raw(generation | slot as u32);
        *env = EnvSlot { id, parent, status: EnvStatus::NotRunnable, ..EnvSlot::free() };
        Ok(id)
    }

    fn free_env(&mut self, slot: usize) {
        let pages = self.envs[slot].space.present();
        for (pn, _) in pages {
            self.remove(slot, pn);
        }
        let env = &mut self.envs[slot];
        env.space = AddressSpace::default();
        env.status = EnvStatus::Free;
        env.upcall = None;
        env.in_upcall = false;
        env.resume_as_child = false;
    }

    // ——— frames and mappings ———

    fn alloc_frame(&mut self) -> SysResult<u32> {
        let frame = self.free_frames.pop().ok_or(AbiError::NoMem)?;
        self.frames[frame as usize].bytes.fill(0);
        Ok(frame)
    }

    fn decref(&mut self, frame: u32) {
        let entry = &mut self.frames[frame as usize];
        entry.refs -= 1;
        if entry.refs == 0 {
            self.free_frames.push(frame);
        }
    }

    /// Installs `frame` at `pn`, replacing and releasing any previous mapping.
    /// The new reference is taken first so re-inserting the same frame is safe.
    fn insert(&mut self, slot: usize, pn: PageNum, frame: u32, perm: PteFlags) {
        self.frames[frame as usize].refs += 1;
        let old = self.envs[slot].space.get(pn);
        if old.is_present() {
            self.decref(old.frame());
        }
        self.envs[slot].space.set(pn, Pte::new(frame, perm));
    }

    fn remove(&mut self, slot: usize, pn: PageNum) {
        let old = self.envs[slot].space.get(pn);
        if old.is_present() {
            self.envs[slot].space.set(pn, Pte::EMPTY);
            self.decref(old.frame());
        }
    }

    // ——— syscalls ———

    pub(crate) fn exofork(&mut self, caller: EnvId) -> SysResult<EnvId> {
        let me = self.live_slot(caller)?;
        let child = self.alloc_env(self.envs[me].id)?;
        self.envs[envx(child)].resume_as_child = true;
        debug!(target: "host", "exofork {caller} -> {child}");
        Ok(child)
    }

    /// Consumes the pending child-side return of `exofork`, if any.
    pub(crate) fn take_child_return(&mut self, caller: EnvId) -> SysResult<bool> {
        let me = self.live_slot(caller)?;
        Ok(core::mem::take(&mut self.envs[me].resume_as_child))
    }

    pub(crate) fn page_alloc(
        &mut self,
        caller: EnvId,
        env: EnvId,
        va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let slot = self.resolve(caller, env, true)?;
        check_va(va)?;
        check_perm(perm)?;
        let frame = self.alloc_frame()?;
        self.insert(slot, va.page(), frame, perm);
        Ok(())
    }

    pub(crate) fn page_map(
        &mut self,
        caller: EnvId,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let src = self.resolve(caller, src_env, true)?;
        let dst = self.resolve(caller, dst_env, true)?;
        check_va(src_va)?;
        check_va(dst_va)?;
        let pte = self.envs[src].space.get(src_va.page());
        if !pte.is_present() {
            return Err(AbiError::Inval);
        }
        check_perm(perm)?;
        if perm.contains(PteFlags::WRITABLE) && !pte.flags().contains(PteFlags::WRITABLE) {
            return Err(AbiError::Inval);
        }
        self.insert(dst, dst_va.page(), pte.frame(), perm);
        Ok(())
    }

    pub(crate) fn page_unmap(&mut self, caller: EnvId, env: EnvId, va: VirtAddr) -> SysResult<()> {
        let slot = self.resolve(caller, env, true)?;
        check_va(va)?;
        self.remove(slot, va.page());
        Ok(())
    }

    pub(crate) fn set_upcall(&mut self, caller: EnvId, env: EnvId, entry: VirtAddr) -> SysResult<()> {
        let slot = self.resolve(caller, env, true)?;
        self.envs[slot].upcall = Some(entry);
        Ok(())
    }

    pub(crate) fn set_status(
        &mut self,
        caller: EnvId,
        env: EnvId,
        status: EnvStatus,
    ) -> SysResult<()> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(AbiError::Inval);
        }
        let slot = self.resolve(caller, env, true)?;
        self.envs[slot].status = status;
        Ok(())
    }

    pub(crate) fn destroy(&mut self, caller: EnvId, env: EnvId) -> SysResult<()> {
        let slot = self.resolve(caller, env, true)?;
        debug!(target: "host", "destroy {}", self.envs[slot].id);
        self.free_env(slot);
        Ok(())
    }

    // ——— read-only views ———

    pub(crate) fn pde(&self, caller: EnvId, pdx: u32) -> Pte {
        self.live_slot(caller).map_or(Pte::EMPTY, |slot| self.envs[slot].space.pde(pdx))
    }

    pub(crate) fn pte(&self, caller: EnvId, pn: PageNum) -> Pte {
        self.live_slot(caller).map_or(Pte::EMPTY, |slot| self.envs[slot].space.get(pn))
    }

    pub(crate) fn env_info(&self, slot: usize) -> Option<EnvInfo> {
        self.envs.get(slot).filter(|env| env.status != EnvStatus::Free).map(|env| EnvInfo {
            id: env.id,
            parent: env.parent,
            status: env.status,
            pgfault_upcall: env.upcall,
        })
    }

    // ——— user memory ———

    /// Frame backing `va` if the caller may access it, or the fault the
    /// access raises.
    fn translate(&self, slot: usize, va: VirtAddr, write: bool) -> Result<u32, FaultRecord> {
        let pte = if va.is_user() { self.envs[slot].space.get(va.page()) } else { Pte::EMPTY };
        let mut need = PteFlags::USER_PRESENT;
        if write {
            need |= PteFlags::WRITABLE;
        }
        if pte.flags().contains(need) {
            return Ok(pte.frame());
        }
        let mut code = FaultCode::USER;
        if pte.is_present() {
            code |= FaultCode::PROTECTION;
        }
        if write {
            code |= FaultCode::WRITE;
        }
        Err(FaultRecord { va, code })
    }

    pub(crate) fn load(&mut self, caller: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), Trap> {
        let slot = self.live_slot(caller).map_err(|_| Trap::Dead { env: caller })?;
        for (addr, range) in chunks(va, buf.len()) {
            let frame = self.translate(slot, addr, false).map_err(|record| self.raise(slot, record))?;
            let off = addr.page_offset() as usize;
            buf[range.clone()]
                .copy_from_slice(&self.frames[frame as usize].bytes[off..off + range.len()]);
        }
        Ok(())
    }

    pub(crate) fn store(&mut self, caller: EnvId, va: VirtAddr, bytes: &[u8]) -> Result<(), Trap> {
        let slot = self.live_slot(caller).map_err(|_| Trap::Dead { env: caller })?;
        for (addr, range) in chunks(va, bytes.len()) {
            let frame = self.translate(slot, addr, true).map_err(|record| self.raise(slot, record))?;
            let off = addr.page_offset() as usize;
            self.frames[frame as usize].bytes[off..off + range.len()]
                .copy_from_slice(&bytes[range]);
        }
        Ok(())
    }

    pub(crate) fn copy_page(&mut self, caller: EnvId, dst: VirtAddr, src: VirtAddr) -> SysResult<()> {
        let slot = self.live_slot(caller)?;
        let from = self.translate(slot, src.page_down(), false).map_err(|_| AbiError::Fault)?;
        let to = self.translate(slot, dst.page_down(), true).map_err(|_| AbiError::Fault)?;
        if from != to {
            let bytes = self.frames[from as usize].bytes.clone();
            self.frames[to as usize].bytes.copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Turns a failed access into an upcall, or kills the environment when
    /// the fault cannot be delivered.
    fn raise(&mut self, slot: usize, record: FaultRecord) -> Trap {
        let env = &self.envs[slot];
        let id = env.id;
        let xstack = env.space.get(VirtAddr::EXCEPTION_STACK.page());
        let verdict = match env.upcall {
            None => Err(KillReason::NoUpcall),
            Some(_) if env.in_upcall => Err(KillReason::NestedFault),
            Some(_) if !xstack.flags().contains(PteFlags::USER_RW) => {
                Err(KillReason::NoExceptionStack)
            }
            Some(entry) => Ok(entry),
        };
        match verdict {
            Ok(entry) => {
                self.envs[slot].in_upcall = true;
                debug!(target: "host", "[{id}] fault {record} -> upcall {entry}");
                Trap::Upcall { entry, record }
            }
            Err(reason) => {
                warn!(target: "host", "[{id}] killed on fault {record}: {reason}");
                self.free_env(slot);
                Trap::Killed { env: id, reason, record }
            }
        }
    }

    pub(crate) fn upcall_return(&mut self, caller: EnvId) {
        if let Ok(slot) = self.live_slot(caller) {
            self.envs[slot].in_upcall = false;
        }
    }
}

fn check_va(va: VirtAddr) -> SysResult<()> {
    if va.is_user() && va.is_page_aligned() {
        Ok(())
    } else {
        Err(AbiError::Inval)
    }
}

fn check_perm(perm: PteFlags) -> SysResult<()> {
    if perm.is_valid_syscall_perm() {
        Ok(())
    } else {
        Err(AbiError::Inval)
    }
}

/// Splits `[va, va + len)` at page boundaries.
fn chunks(va: VirtAddr, len: usize) -> Vec<(VirtAddr, core::ops::Range<usize>)> {
    let mut out = Vec::new();
    let mut done = 0usize;
    while done < len {
        let addr = VirtAddr::new(va.raw().wrapping_add(done as u32));
        let room = (PGSIZE - addr.page_offset()) as usize;
        let take = room.min(len - done);
        out.push((addr, done..done + take));
        done += take;
    }
    out
}

/// Handle to an in-process exokernel model.
///
/// Cloning yields another handle to the same machine.
#[derive(Clone)]
pub struct HostMachine {
    inner: Arc<Mutex<State>>,
}

impl HostMachine {
    /// Creates a machine with `config.frames` free frames and no environments.
    pub fn new(config: HostConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(State::new(config))) }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Creates a runnable root environment with an empty address space.
    pub fn spawn(&self) -> SysResult<HostEnv> {
        let id = self.with(|state| {
            let id = state.alloc_env(EnvId::SELF)?;
            state.envs[envx(id)].status = EnvStatus::Runnable;
            Ok::<_, AbiError>(id)
        })?;
        debug!(target: "host", "spawned {id}");
        Ok(HostEnv::new(self.clone(), id))
    }

    /// Returns the view of a runnable environment, typically a forked child.
    pub fn resume(&self, env: EnvId) -> SysResult<HostEnv> {
        self.with(|state| {
            let slot = state.live_slot(env)?;
            if state.envs[slot].status != EnvStatus::Runnable {
                return Err(AbiError::BadEnv);
            }
            Ok(())
        })?;
        Ok(HostEnv::new(self.clone(), env))
    }

    /// Frame mapped at `va` in `env`.
    pub fn frame_of(&self, env: EnvId, va: VirtAddr) -> Option<u32> {
        self.entry(env, va).map(Pte::frame)
    }

    /// Flags of the mapping at `va` in `env`.
    pub fn flags_of(&self, env: EnvId, va: VirtAddr) -> Option<PteFlags> {
        self.entry(env, va).map(Pte::flags)
    }

    fn entry(&self, env: EnvId, va: VirtAddr) -> Option<Pte> {
        self.with(|state| {
            let slot = state.live_slot(env).ok()?;
            Some(state.envs[slot].space.get(va.page())).filter(|pte| pte.is_present())
        })
    }

    /// Status of `env`; `None` once the slot has been freed or reused.
    pub fn status(&self, env: EnvId) -> Option<EnvStatus> {
        self.with(|state| state.live_slot(env).ok().map(|slot| state.envs[slot].status))
    }

    /// Number of mappings referencing `frame`.
    pub fn refcount(&self, frame: u32) -> u32 {
        self.with(|state| state.frames.get(frame as usize).map_or(0, |f| f.refs))
    }

    /// Frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.with(|state| state.free_frames.len())
    }

    /// Environments that are not free.
    pub fn env_count(&self) -> usize {
        self.with(|state| state.envs.iter().filter(|env| env.status != EnvStatus::Free).count())
    }
}

impl Default for HostMachine {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}
