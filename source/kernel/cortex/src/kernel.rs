// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state and environment lifecycle
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (new/create_env/enter/sched_yield/env_info/page_entry/peek), KernelLock
//! DEPENDS_ON: env::EnvTable, mm::{FramePool, Tlb}, sched::Scheduler, trap::UpcallTable, syscall::SyscallTable
//! INVARIANTS: At most one environment is current and only it can issue syscalls;
//!             a Dying slot holds no frames and becomes Free on the next scheduling pass

extern crate alloc;

use alloc::vec::Vec;
use cortex_abi::layout::{PAGE_SIZE, USTACKTOP};
use cortex_abi::{EnvId, EnvInfo, EnvStatus, Pte, PteFlags, SysError, SysResult, Trapframe, VirtAddr};

use crate::config::KernelConfig;
use crate::context::UserContext;
use crate::env::EnvTable;
use crate::mm::{AllocFlags, FramePool, Tlb};
use crate::sched::{EnqueueOutcome, Scheduler};
use crate::syscall::{self, SyscallTable};
use crate::trap::UpcallTable;

/// The whole kernel model: one CPU, one frame pool, one environment table.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) frames: FramePool,
    pub(crate) envs: EnvTable,
    pub(crate) sched: Scheduler,
    pub(crate) tlb: Tlb,
    pub(crate) upcalls: UpcallTable,
    pub(crate) syscalls: SyscallTable,
    pub(crate) current: Option<EnvId>,
}

static_assertions::assert_impl_all!(Kernel: Send);

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let config = config.normalized();
        let mut syscalls = SyscallTable::new();
        syscall::api::install_handlers(&mut syscalls);
        log::info!(
            target: "env",
            "kernel up: {} env slots, {} frames, {}-entry tlb",
            config.max_envs,
            config.phys_frames,
            config.tlb_entries
        );
        Self {
            config,
            frames: FramePool::new(config.phys_frames),
            envs: EnvTable::new(config.max_envs),
            sched: Scheduler::new(config.max_envs),
            tlb: Tlb::new(config.tlb_entries),
            upcalls: UpcallTable::new(),
            syscalls,
            current: None,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    /// Makes the next page-table allocation fail with `NoMemory`.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_table_alloc(&mut self) {
        self.frames.deny_next_table_alloc();
    }

    /// Environment currently holding the CPU.
    pub fn current(&self) -> Option<EnvId> {
        self.current
    }

    pub fn env_info(&self, id: EnvId) -> Option<EnvInfo> {
        self.envs.find(id).map(|env| env.info())
    }

    /// Snapshot of every live environment.
    pub fn env_infos(&self) -> impl Iterator<Item = EnvInfo> + '_ {
        self.envs.iter().map(|env| env.info())
    }

    pub fn trapframe(&self, id: EnvId) -> Option<Trapframe> {
        self.envs.find(id).map(|env| env.tf)
    }

    /// PTE of `va` in `id`, if a page table covers it.
    pub fn page_entry(&self, id: EnvId, va: VirtAddr) -> Option<Pte> {
        self.envs.find(id)?.pgdir.as_ref()?.entry(va)
    }

    /// Copies user memory out of `id` without faulting; `false` if any page is unmapped.
    pub fn peek(&self, id: EnvId, va: VirtAddr, buf: &mut [u8]) -> bool {
        let Some(pgdir) = self.envs.find(id).and_then(|env| env.pgdir.as_ref()) else {
            return false;
        };
        let mut done = 0usize;
        while done < buf.len() {
            let Some(addr) = va.checked_add(done as u32) else {
                return false;
            };
            let Some(pte) = pgdir.lookup(addr.round_down()) else {
                return false;
            };
            let off = addr.page_offset();
            let chunk = (PAGE_SIZE - off).min(buf.len() - done);
            buf[done..done + chunk].copy_from_slice(&self.frames.bytes(pte.frame())[off..off + chunk]);
            done += chunk;
        }
        true
    }

    /// Builds a root environment entering at `entry` with one user stack page.
    pub fn create_env(&mut self, entry: u32) -> SysResult<EnvId> {
        let id = self.envs.alloc(None, &mut self.frames)?;
        let slot = id.slot();
        self.envs.get_mut(slot).tf = Trapframe::user(entry, USTACKTOP);

        let stack = VirtAddr::new(USTACKTOP - PAGE_SIZE as u32);
        if let Err(err) = self.map_fresh_page(slot, stack, PteFlags::USER_RW) {
            self.envs.teardown(slot, &mut self.frames, &mut self.tlb);
            self.envs.release(slot);
            return Err(err);
        }
        self.mark_runnable(slot);
        log::info!(target: "env", "created root env {} entry={:#x}", id, entry);
        Ok(id)
    }

    /// Switches the CPU to `id` and returns its syscall context.
    ///
    /// `id` must be Runnable or already running. Dying environments are reaped first.
    pub fn enter(&mut self, id: EnvId) -> SysResult<UserContext<'_>> {
        self.reap();
        let slot = self.envs.find(id).map(|env| env.slot()).ok_or(SysError::BadTarget)?;
        if self.current != Some(id) {
            if self.envs.get(slot).status != EnvStatus::Runnable {
                return Err(SysError::BadTarget);
            }
            self.preempt_current();
            self.sched.purge(id);
            self.switch_to(slot);
        }
        Ok(UserContext::new(self, id))
    }

    /// Gives the CPU to the next runnable environment.
    ///
    /// The running environment goes to the back of the queue; with nothing else
    /// runnable it is picked again. Returns the new current environment.
    pub fn sched_yield(&mut self) -> Option<EnvId> {
        self.preempt_current();
        self.reap();
        while let Some(next) = self.sched.next() {
            let Some(slot) = self.envs.find(next).map(|env| env.slot()) else {
                continue;
            };
            if self.envs.get(slot).status == EnvStatus::Runnable {
                self.switch_to(slot);
                return Some(next);
            }
        }
        log::debug!(target: "sched", "no runnable environment");
        None
    }

    fn preempt_current(&mut self) {
        let Some(cur) = self.current.take() else {
            return;
        };
        let Some(slot) = self.envs.find(cur).map(|env| env.slot()) else {
            return;
        };
        if self.envs.get(slot).status == EnvStatus::Running {
            self.mark_runnable(slot);
        }
    }

    fn switch_to(&mut self, slot: usize) {
        let env = self.envs.get_mut(slot);
        env.status = EnvStatus::Running;
        env.stats.runs += 1;
        self.current = Some(env.id);
        log::trace!(target: "sched", "run {}", env.id);
    }

    /// Frees every `Dying` slot.
    pub fn reap(&mut self) {
        let dying: Vec<usize> = self.envs.dying().collect();
        for slot in dying {
            if self.current == Some(self.envs.get(slot).id) {
                self.current = None;
            }
            self.envs.release(slot);
        }
    }

    pub(crate) fn mark_runnable(&mut self, slot: usize) {
        let env = self.envs.get_mut(slot);
        env.status = EnvStatus::Runnable;
        let id = env.id;
        match self.sched.enqueue(id) {
            EnqueueOutcome::Enqueued => {}
            EnqueueOutcome::Rejected(reason) => {
                log::trace!(target: "sched", "enqueue {} skipped: {:?}", id, reason);
            }
        }
    }

    pub(crate) fn mark_not_runnable(&mut self, slot: usize) {
        let env = self.envs.get_mut(slot);
        env.status = EnvStatus::NotRunnable;
        let id = env.id;
        self.sched.purge(id);
    }

    /// Releases the address space of `slot`.
    ///
    /// The current environment (or one inside its fault upcall) lingers as `Dying`
    /// until the next scheduling pass; any other slot is freed at once.
    pub(crate) fn destroy(&mut self, slot: usize) {
        let id = self.envs.get(slot).id;
        let lingering = self.current == Some(id) || self.envs.get(slot).in_upcall;
        self.envs.teardown(slot, &mut self.frames, &mut self.tlb);
        self.sched.purge(id);
        if lingering {
            self.envs.get_mut(slot).status = EnvStatus::Dying;
            log::info!(target: "env", "env {} dying", id);
        } else {
            self.envs.release(slot);
            log::info!(target: "env", "env {} destroyed", id);
        }
    }

    /// Allocates a zeroed frame and maps it at `va` in `slot`; no leak on failure.
    pub(crate) fn map_fresh_page(&mut self, slot: usize, va: VirtAddr, perm: PteFlags) -> SysResult<()> {
        let frame = self.frames.alloc(AllocFlags::ZERO).map_err(|_| SysError::NoMemory)?;
        let env = self.envs.get_mut(slot);
        let Some(pgdir) = env.pgdir.as_mut() else {
            self.frames.free(frame);
            return Err(SysError::BadTarget);
        };
        if let Err(err) = pgdir.insert(&mut self.frames, &mut self.tlb, slot, frame, va, perm) {
            self.frames.free(frame);
            log::debug!(target: "mm", "page_alloc {:?} failed: {:?}", va, err);
            return Err(SysError::NoMemory);
        }
        Ok(())
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

/// Big kernel lock: every syscall runs with the whole kernel held.
pub struct KernelLock {
    inner: spin::Mutex<Kernel>,
}

static_assertions::assert_impl_all!(KernelLock: Send, Sync);

impl KernelLock {
    pub fn new(kernel: Kernel) -> Self {
        Self { inner: spin::Mutex::new(kernel) }
    }

    /// Runs `f` with exclusive access to the kernel.
    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    pub fn into_inner(self) -> Kernel {
        self.inner.into_inner()
    }
}
