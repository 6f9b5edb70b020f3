// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault delivery to user upcalls
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{sys_env_set_pgfault_upcall, page_fault}, UpcallTable
//! DEPENDS_ON: context::UserContext (runs the handler), mm::translate
//! INVARIANTS: The record is pushed at the top of a mapped, user-writable exception stack;
//!             a fault while already in the upcall, or a handler error, kills only the faulting env

mod upcall;

pub use upcall::UpcallTable;

use cortex_abi::layout::{PAGE_SIZE, UXSTACKTOP};
use cortex_abi::trapframe::UTRAPFRAME_SIZE;
use cortex_abi::{
    EnvId, FaultCode, MemoryFault, PteFlags, SysResult, UTrapframe, UpcallAddr, UpcallEntry,
    VirtAddr,
};

use crate::context::UserContext;
use crate::kernel::Kernel;

/// Page holding the user exception stack.
pub const UXSTACK_PAGE: VirtAddr = VirtAddr::new(UXSTACKTOP - PAGE_SIZE as u32);
/// Where the fault record lands: the top of the exception stack.
const RECORD_OFFSET: usize = PAGE_SIZE - UTRAPFRAME_SIZE;

impl Kernel {
    /// Records the fault upcall of `env` by entry function.
    pub fn sys_env_set_pgfault_upcall(
        &mut self,
        caller: EnvId,
        env: EnvId,
        entry: UpcallEntry,
    ) -> SysResult<()> {
        let slot = self.envs.resolve(env, caller, true)?;
        let addr = self.upcalls.register(entry);
        self.envs.get_mut(slot).pgfault_upcall = Some(addr);
        Ok(())
    }

    /// Records the fault upcall of `env` by code address.
    ///
    /// The address is not checked here; an unknown address is fatal at the first fault.
    pub fn sys_env_set_pgfault_upcall_addr(
        &mut self,
        caller: EnvId,
        env: EnvId,
        addr: UpcallAddr,
    ) -> SysResult<()> {
        let slot = self.envs.resolve(env, caller, true)?;
        self.envs.get_mut(slot).pgfault_upcall = Some(addr);
        Ok(())
    }

    /// Handles a user page fault of `id` at `va`.
    ///
    /// On success the handler ran and the register state was restored from the
    /// record on the exception stack; the caller retries the access.
    pub fn page_fault(&mut self, id: EnvId, va: VirtAddr, code: FaultCode) -> Result<(), MemoryFault> {
        let slot = self
            .envs
            .find(id)
            .map(|env| env.slot())
            .ok_or(MemoryFault::NotRunning(id))?;
        let env = self.envs.get_mut(slot);
        env.stats.page_faults += 1;

        if env.in_upcall {
            return Err(self.kill(slot, va, "fault inside page-fault upcall"));
        }
        let Some(addr) = env.pgfault_upcall else {
            return Err(self.kill(slot, va, "no page-fault upcall"));
        };
        let Some(entry) = self.upcalls.resolve(addr) else {
            return Err(self.kill(slot, va, "page-fault upcall is not mapped code"));
        };
        let Some(stack) = self.exception_stack(slot) else {
            return Err(self.kill(slot, va, "exception stack not mapped writable"));
        };

        let env = self.envs.get_mut(slot);
        let utf = UTrapframe::capture(va, code, &env.tf);
        env.tf.esp = UXSTACKTOP - UTRAPFRAME_SIZE as u32;
        env.tf.eip = addr.0;
        env.in_upcall = true;
        env.stats.upcalls += 1;
        if let Some(bytes) = self.frames.bytes_mut(stack) {
            bytes[RECORD_OFFSET..].copy_from_slice(&utf.to_le_bytes());
        }
        log::debug!(target: "trap", "{} fault va={:?} err={:?} -> upcall {:#x}", id, va, code, addr.0);

        let outcome = entry(&mut UserContext::new(self, id), &utf);

        // The handler may have destroyed the environment itself.
        let Some(env) = self.envs.find(id).filter(|env| env.is_alive()) else {
            return Err(MemoryFault::Killed { env: id, va });
        };
        let slot = env.slot();
        self.envs.get_mut(slot).in_upcall = false;
        if let Err(panic) = outcome {
            log::warn!(target: "trap", "{} upcall panicked: {}", id, panic);
            return Err(self.kill(slot, va, panic.reason));
        }
        let Some(stack) = self.exception_stack(slot) else {
            return Err(self.kill(slot, va, "exception stack vanished during upcall"));
        };
        let mut record = [0u8; UTRAPFRAME_SIZE];
        record.copy_from_slice(&self.frames.bytes(stack)[RECORD_OFFSET..]);
        UTrapframe::from_le_bytes(record).restore_into(&mut self.envs.get_mut(slot).tf);
        Ok(())
    }

    /// Frame of the exception stack if it is mapped present, user and writable.
    fn exception_stack(&self, slot: usize) -> Option<cortex_abi::FrameNumber> {
        self.envs
            .get(slot)
            .pgdir
            .as_ref()?
            .lookup(UXSTACK_PAGE)
            .filter(|pte| pte.flags().contains(PteFlags::USER_RW))
            .map(|pte| pte.frame())
    }

    fn kill(&mut self, slot: usize, va: VirtAddr, reason: &str) -> MemoryFault {
        let id = self.envs.get(slot).id;
        log::warn!(target: "trap", "[{}] fatal fault at {:?}: {}", id, va, reason);
        self.destroy(slot);
        MemoryFault::Killed { env: id, va }
    }
}
