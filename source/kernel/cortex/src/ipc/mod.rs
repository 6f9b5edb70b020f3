// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous rendezvous IPC (one word plus an optional page)
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: Kernel::{sys_ipc_try_send, sys_ipc_recv}
//! DEPENDS_ON: aspace (address/permission checks), env::IpcState, sched
//! INVARIANTS: A receiver accepts exactly one message per ipc_recv; the recving/from pair is
//!             checked and updated under the same kernel entry, so racing senders see one winner

use cortex_abi::{EnvId, PteFlags, SysError, SysResult, VirtAddr};

use crate::aspace::{user_page, user_perm};
use crate::env::IpcState;
use crate::kernel::Kernel;

impl Kernel {
    /// Delivers `value` (and the page at `srcva`, if below `UTOP`) to `env`.
    ///
    /// Fails with `TargetNotReceiving` unless `env` is blocked in `ipc_recv` and
    /// has not been claimed by another sender. The page is only transferred if
    /// the receiver asked for one; otherwise the value alone is delivered.
    pub fn sys_ipc_try_send(
        &mut self,
        caller: EnvId,
        env: EnvId,
        value: u32,
        srcva: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let dst_slot = self.envs.resolve(env, caller, false)?;
        let src_slot = self.envs.resolve(caller, caller, false)?;
        let target = self.envs.get(dst_slot);
        if !target.ipc.recving || target.ipc.from.is_some() {
            return Err(SysError::TargetNotReceiving);
        }
        let dstva = target.ipc.dstva;
        let target_id = target.id;
        let sender = self.envs.get(src_slot).id;

        let mut delivered = PteFlags::empty();
        if srcva.is_user() {
            let srcva = user_page(srcva)?;
            let perm = user_perm(perm)?;
            let pte = self
                .envs
                .get(src_slot)
                .pgdir
                .as_ref()
                .and_then(|pgdir| pgdir.lookup(srcva))
                .ok_or(SysError::InvalidArgument)?;
            if perm.contains(PteFlags::WRITABLE) && !pte.flags().contains(PteFlags::WRITABLE) {
                return Err(SysError::InvalidArgument);
            }
            if let Some(dstva) = dstva {
                self.insert_frame(dst_slot, pte.frame(), dstva, perm)?;
                delivered = perm;
            }
        }

        let receiver = self.envs.get_mut(dst_slot);
        receiver.ipc = IpcState {
            recving: false,
            dstva: None,
            from: Some(sender),
            value,
            perm: delivered,
        };
        receiver.tf.regs.eax = 0;
        self.mark_runnable(dst_slot);
        log::debug!(
            target: "ipc",
            "{} -> {} value={:#x} perm={:?}",
            caller,
            target_id,
            value,
            delivered
        );
        Ok(())
    }

    /// Blocks `caller` until a sender arrives and yields the CPU.
    ///
    /// `dstva` below `UTOP` asks for a page at that (aligned) address; anything
    /// at or above `UTOP` means no page is wanted.
    pub fn sys_ipc_recv(&mut self, caller: EnvId, dstva: VirtAddr) -> SysResult<()> {
        let slot = self.envs.resolve(caller, caller, false)?;
        let dstva = if dstva.is_user() { Some(user_page(dstva)?) } else { None };

        let env = self.envs.get_mut(slot);
        env.ipc.recving = true;
        env.ipc.dstva = dstva;
        env.ipc.from = None;
        log::debug!(target: "ipc", "{} waiting (dstva={:?})", caller, dstva);
        self.mark_not_runnable(slot);
        self.sched_yield();
        Ok(())
    }
}
