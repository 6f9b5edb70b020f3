// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment table with generation-tagged slots
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Env, EnvTable (alloc/resolve/release/info), IpcState, EnvError
//! DEPENDS_ON: mm::{FramePool, PageDirectory, Tlb}
//! INVARIANTS: A handle resolves only while its slot is live and carries the same generation;
//!             a slot's generation changes every time it is released

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use cortex_abi::env::LOG2NENV;
use cortex_abi::{EnvId, EnvInfo, EnvStatus, PteFlags, SysError, Trapframe, UpcallAddr, VirtAddr};

use crate::mm::{FramePool, MapError, PageDirectory, Tlb};

/// Generations stay below this so every handle is a non-negative syscall return value.
const MAX_GENERATION: u32 = 1 << (31 - LOG2NENV);

/// Errors raised while allocating an environment.
#[must_use = "environment allocation errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// Every slot is in use.
    NoFreeSlot,
    /// The page directory could not be allocated.
    Map(MapError),
}

impl From<MapError> for EnvError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<EnvError> for SysError {
    fn from(value: EnvError) -> Self {
        match value {
            EnvError::NoFreeSlot => SysError::NoFreeSlot,
            EnvError::Map(_) => SysError::NoMemory,
        }
    }
}

/// Rendezvous state of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcState {
    pub recving: bool,
    pub dstva: Option<VirtAddr>,
    pub from: Option<EnvId>,
    pub value: u32,
    pub perm: PteFlags,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvStats {
    pub runs: u32,
    pub page_faults: u32,
    pub upcalls: u32,
}

/// One environment slot.
pub struct Env {
    pub id: EnvId,
    pub parent: Option<EnvId>,
    pub status: EnvStatus,
    pub tf: Trapframe,
    pub pgdir: Option<PageDirectory>,
    pub pgfault_upcall: Option<UpcallAddr>,
    pub ipc: IpcState,
    /// Running its fault upcall; a further fault is fatal.
    pub in_upcall: bool,
    pub stats: EnvStats,
    generation: u32,
}

impl Env {
    fn vacant(slot: usize) -> Self {
        Self {
            id: EnvId::new(slot, 1),
            parent: None,
            status: EnvStatus::Free,
            tf: Trapframe::default(),
            pgdir: None,
            pgfault_upcall: None,
            ipc: IpcState::default(),
            in_upcall: false,
            stats: EnvStats::default(),
            generation: 1,
        }
    }

    pub fn slot(&self) -> usize {
        self.id.slot()
    }

    pub fn is_live(&self) -> bool {
        self.status != EnvStatus::Free
    }

    /// Live and not on its way out.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.status,
            EnvStatus::Runnable | EnvStatus::Running | EnvStatus::NotRunnable
        )
    }

    pub fn info(&self) -> EnvInfo {
        EnvInfo {
            id: self.id,
            parent: self.parent,
            status: self.status,
            ipc_recving: self.ipc.recving,
            ipc_dstva: self.ipc.dstva,
            ipc_from: self.ipc.from,
            ipc_value: self.ipc.value,
            ipc_perm: self.ipc.perm,
            runs: self.stats.runs,
            page_faults: self.stats.page_faults,
            upcalls: self.stats.upcalls,
        }
    }
}

/// Fixed-size environment table.
pub struct EnvTable {
    envs: Vec<Env>,
    free: VecDeque<usize>,
}

impl EnvTable {
    pub fn new(slots: usize) -> Self {
        Self {
            envs: (0..slots).map(Env::vacant).collect(),
            free: (0..slots).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.envs.len()
    }

    /// Allocates a slot and its page directory.
    ///
    /// The environment starts `NotRunnable` with an empty address space.
    pub fn alloc(
        &mut self,
        parent: Option<EnvId>,
        frames: &mut FramePool,
    ) -> Result<EnvId, EnvError> {
        let slot = *self.free.front().ok_or(EnvError::NoFreeSlot)?;
        let pgdir = PageDirectory::new(frames)?;
        self.free.pop_front();

        let env = &mut self.envs[slot];
        env.id = EnvId::new(slot, env.generation);
        env.parent = parent;
        env.status = EnvStatus::NotRunnable;
        env.tf = Trapframe::default();
        env.pgdir = Some(pgdir);
        env.pgfault_upcall = None;
        env.ipc = IpcState::default();
        env.in_upcall = false;
        env.stats = EnvStats::default();
        log::debug!(target: "env", "alloc {} parent={:?}", env.id, parent);
        Ok(env.id)
    }

    /// Looks up `id` on behalf of `caller`.
    ///
    /// `EnvId::SELF` names the caller. A `Dying` environment no longer resolves.
    /// With `checkperm`, the target must be the caller itself or one of its
    /// immediate children.
    pub fn resolve(&self, id: EnvId, caller: EnvId, checkperm: bool) -> Result<usize, SysError> {
        let id = if id.is_self() { caller } else { id };
        let env = self.envs.get(id.slot()).ok_or(SysError::BadTarget)?;
        if !env.is_alive() || env.id != id {
            return Err(SysError::BadTarget);
        }
        if checkperm && env.id != caller && env.parent != Some(caller) {
            log::warn!(target: "env", "{} may not operate on {}", caller, id);
            return Err(SysError::BadTarget);
        }
        Ok(id.slot())
    }

    /// Looks up a live handle without ownership checks.
    pub fn find(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id.slot()).filter(|env| env.is_live() && env.id == id)
    }

    pub fn get(&self, slot: usize) -> &Env {
        &self.envs[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Env {
        &mut self.envs[slot]
    }

    /// Tears down the address space of `slot` and leaves the slot in `status`.
    pub fn teardown(&mut self, slot: usize, frames: &mut FramePool, tlb: &mut Tlb) {
        let env = &mut self.envs[slot];
        if let Some(pgdir) = env.pgdir.take() {
            pgdir.release(frames, tlb, slot);
        }
        env.pgfault_upcall = None;
        env.ipc = IpcState::default();
        env.in_upcall = false;
    }

    /// Returns a torn-down slot to the free list under a new generation.
    pub fn release(&mut self, slot: usize) {
        let env = &mut self.envs[slot];
        debug_assert!(env.pgdir.is_none());
        env.status = EnvStatus::Free;
        env.generation += 1;
        if env.generation >= MAX_GENERATION {
            env.generation = 1;
        }
        log::debug!(target: "env", "slot {} free (was {})", slot, env.id);
        self.free.push_front(slot);
    }

    /// Live environments.
    pub fn iter(&self) -> impl Iterator<Item = &Env> + '_ {
        self.envs.iter().filter(|env| env.is_live())
    }

    /// Slots currently marked `Dying`.
    pub fn dying(&self) -> impl Iterator<Item = usize> + '_ {
        self.envs
            .iter()
            .filter(|env| env.status == EnvStatus::Dying)
            .map(Env::slot)
    }
}
