// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space and environment-control syscalls
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Kernel::{sys_exofork, sys_env_set_status, sys_env_set_trapframe, sys_env_destroy,
//!             sys_page_alloc, sys_page_map, sys_page_unmap}
//! DEPENDS_ON: env::EnvTable (ownership checks), mm::PageDirectory
//! INVARIANTS: Target resolution happens before any argument validation;
//!             argument validation happens before any state change;
//!             a frame obtained by a failing call is returned before the error is reported

use cortex_abi::trapframe::{FL_IF, GD_UD, GD_UT};
use cortex_abi::{EnvId, EnvStatus, PteFlags, SysError, SysResult, Trapframe, VirtAddr};

use crate::kernel::Kernel;

/// Page-aligned user address, or `InvalidArgument`.
pub(crate) fn user_page(va: VirtAddr) -> SysResult<VirtAddr> {
    if va.is_user() && va.is_aligned() {
        Ok(va)
    } else {
        Err(SysError::InvalidArgument)
    }
}

/// Permission argument of a mapping call, or `InvalidArgument`.
pub(crate) fn user_perm(perm: PteFlags) -> SysResult<PteFlags> {
    if perm.is_valid_user_perm() {
        Ok(perm)
    } else {
        Err(SysError::InvalidArgument)
    }
}

impl Kernel {
    /// Creates a child of `caller` with no mappings whose saved `eax` is zero.
    pub fn sys_exofork(&mut self, caller: EnvId) -> SysResult<EnvId> {
        let parent = self.envs.resolve(caller, caller, false)?;
        let child = self.envs.alloc(Some(caller), &mut self.frames)?;
        let mut tf = self.envs.get(parent).tf;
        tf.regs.eax = 0;
        self.envs.get_mut(child.slot()).tf = tf;
        log::debug!(target: "env", "exofork {} -> {}", caller, child);
        Ok(child)
    }

    pub fn sys_env_set_status(
        &mut self,
        caller: EnvId,
        env: EnvId,
        status: EnvStatus,
    ) -> SysResult<()> {
        let slot = self.envs.resolve(env, caller, true)?;
        match status {
            EnvStatus::Runnable => {
                // A running environment already holds the CPU; it requeues when it yields.
                if self.envs.get(slot).status != EnvStatus::Running {
                    self.mark_runnable(slot);
                }
            }
            EnvStatus::NotRunnable => self.mark_not_runnable(slot),
            _ => return Err(SysError::InvalidArgument),
        }
        Ok(())
    }

    /// Replaces the saved registers of `env`, forcing user privilege and interrupts on.
    pub fn sys_env_set_trapframe(
        &mut self,
        caller: EnvId,
        env: EnvId,
        tf: &Trapframe,
    ) -> SysResult<()> {
        let slot = self.envs.resolve(env, caller, true)?;
        let mut tf = *tf;
        tf.cs = GD_UT;
        tf.ss = GD_UD;
        tf.eflags |= FL_IF;
        self.envs.get_mut(slot).tf = tf;
        Ok(())
    }

    pub fn sys_env_destroy(&mut self, caller: EnvId, env: EnvId) -> SysResult<()> {
        let slot = self.envs.resolve(env, caller, true)?;
        let target = self.envs.get(slot).id;
        if target == caller {
            log::info!(target: "env", "[{}] exiting gracefully", caller);
        } else {
            log::info!(target: "env", "[{}] destroying {}", caller, target);
        }
        self.destroy(slot);
        Ok(())
    }

    /// Maps a fresh zeroed page at `va` in `env`, replacing any existing mapping.
    pub fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        env: EnvId,
        va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let slot = self.envs.resolve(env, caller, true)?;
        let va = user_page(va)?;
        let perm = user_perm(perm)?;
        self.map_fresh_page(slot, va, perm)
    }

    /// Maps the frame behind `srcva` in `src` at `dstva` in `dst`.
    ///
    /// Write permission can only be granted if the source mapping is writable.
    pub fn sys_page_map(
        &mut self,
        caller: EnvId,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let src_slot = self.envs.resolve(src, caller, true)?;
        let dst_slot = self.envs.resolve(dst, caller, true)?;
        let srcva = user_page(srcva)?;
        let dstva = user_page(dstva)?;
        let perm = user_perm(perm)?;

        let pte = self
            .envs
            .get(src_slot)
            .pgdir
            .as_ref()
            .and_then(|pgdir| pgdir.lookup(srcva))
            .ok_or(SysError::InvalidArgument)?;
        if perm.contains(PteFlags::WRITABLE) && !pte.flags().contains(PteFlags::WRITABLE) {
            log::debug!(target: "mm", "page_map {:?} would widen {:?}", srcva, pte.flags());
            return Err(SysError::InvalidArgument);
        }

        self.insert_frame(dst_slot, pte.frame(), dstva, perm)
    }

    /// Removes the mapping at `va` in `env`; nothing mapped is not an error.
    pub fn sys_page_unmap(&mut self, caller: EnvId, env: EnvId, va: VirtAddr) -> SysResult<()> {
        let slot = self.envs.resolve(env, caller, true)?;
        let va = user_page(va)?;
        if let Some(pgdir) = self.envs.get_mut(slot).pgdir.as_mut() {
            pgdir.remove(&mut self.frames, &mut self.tlb, slot, va);
        }
        Ok(())
    }

    pub(crate) fn insert_frame(
        &mut self,
        slot: usize,
        frame: cortex_abi::FrameNumber,
        va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let pgdir = self.envs.get_mut(slot).pgdir.as_mut().ok_or(SysError::BadTarget)?;
        pgdir
            .insert(&mut self.frames, &mut self.tlb, slot, frame, va, perm)
            .map_err(|_| SysError::NoMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use cortex_abi::layout::{PAGE_SIZE, UTOP};

    const RW: PteFlags = PteFlags::USER_RW;
    const RO: PteFlags = PteFlags::USER_PRESENT;

    fn boot(frames: usize) -> (Kernel, EnvId) {
        let mut kernel = Kernel::new(KernelConfig::new().with_phys_frames(frames).with_max_envs(8));
        let root = kernel.create_env(0x0080_0020).unwrap();
        assert_eq!(kernel.sched_yield(), Some(root));
        (kernel, root)
    }

    fn va(raw: u32) -> VirtAddr {
        VirtAddr::new(raw)
    }

    #[test]
    fn exofork_child_is_blank_and_returns_zero() {
        let (mut kernel, root) = boot(32);
        kernel.envs.get_mut(root.slot()).tf.regs.eax = 77;
        let child = kernel.sys_exofork(root).unwrap();

        let info = kernel.env_info(child).unwrap();
        assert_eq!(info.status, EnvStatus::NotRunnable);
        assert_eq!(info.parent, Some(root));
        let tf = kernel.trapframe(child).unwrap();
        assert_eq!(tf.regs.eax, 0);
        assert_eq!(tf.eip, kernel.trapframe(root).unwrap().eip);
        assert!(kernel.envs.get(child.slot()).pgdir.as_ref().unwrap().mappings().next().is_none());
    }

    #[test]
    fn exofork_reports_exhaustion() {
        let mut kernel = Kernel::new(KernelConfig::new().with_phys_frames(32).with_max_envs(1));
        let root = kernel.create_env(0).unwrap();
        assert_eq!(kernel.sys_exofork(root), Err(SysError::NoFreeSlot));
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn exofork_reports_directory_failure() {
        let (mut kernel, root) = boot(32);
        kernel.deny_next_table_alloc();
        assert_eq!(kernel.sys_exofork(root), Err(SysError::NoMemory));
        assert_eq!(kernel.env_infos().count(), 1);
    }

    #[test]
    fn set_status_accepts_only_runnable_states() {
        let (mut kernel, root) = boot(32);
        let child = kernel.sys_exofork(root).unwrap();
        assert_eq!(
            kernel.sys_env_set_status(root, child, EnvStatus::Running),
            Err(SysError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_env_set_status(root, child, EnvStatus::Dying),
            Err(SysError::InvalidArgument)
        );
        kernel.sys_env_set_status(root, child, EnvStatus::Runnable).unwrap();
        assert_eq!(kernel.env_info(child).unwrap().status, EnvStatus::Runnable);
        assert!(kernel.sched.contains(child));
        kernel.sys_env_set_status(root, child, EnvStatus::NotRunnable).unwrap();
        assert!(!kernel.sched.contains(child));
    }

    #[test]
    fn bad_target_is_reported_before_argument_errors() {
        let (mut kernel, root) = boot(32);
        let bogus = EnvId::new(5, 9);
        assert_eq!(
            kernel.sys_page_alloc(root, bogus, va(0x1001), PteFlags::empty()),
            Err(SysError::BadTarget)
        );
        assert_eq!(kernel.sys_page_unmap(root, bogus, va(UTOP)), Err(SysError::BadTarget));
    }

    #[test]
    fn children_cannot_touch_their_parent() {
        let (mut kernel, root) = boot(32);
        let child = kernel.sys_exofork(root).unwrap();
        assert_eq!(kernel.sys_page_alloc(child, root, va(0x1000), RW), Err(SysError::BadTarget));
        assert_eq!(
            kernel.sys_env_set_status(child, root, EnvStatus::NotRunnable),
            Err(SysError::BadTarget)
        );
        kernel.sys_page_alloc(root, child, va(0x1000), RW).unwrap();
    }

    #[test]
    fn page_alloc_validates_address_and_permissions() {
        let (mut kernel, root) = boot(32);
        let free = kernel.frames().free_frames();
        for (addr, perm) in [
            (0x1001, RW),
            (UTOP, RW),
            (0x1000, PteFlags::PRESENT),
            (0x1000, RW | PteFlags::DIRTY),
            (0x1000, RW | PteFlags::COW),
        ] {
            assert_eq!(
                kernel.sys_page_alloc(root, EnvId::SELF, va(addr), perm),
                Err(SysError::InvalidArgument),
                "addr={addr:#x} perm={perm:?}"
            );
        }
        assert_eq!(kernel.frames().free_frames(), free);
    }

    #[test]
    fn page_alloc_zeroes_and_replaces() {
        let (mut kernel, root) = boot(32);
        kernel.sys_page_alloc(root, root, va(0x1000), RW).unwrap();
        let first = kernel.page_entry(root, va(0x1000)).unwrap().frame();
        kernel.frames.bytes_mut(first).unwrap()[0] = 0x5a;

        kernel.sys_page_alloc(root, root, va(0x1000), RW | PteFlags::SHARE).unwrap();
        let second = kernel.page_entry(root, va(0x1000)).unwrap();
        assert!(kernel.frames().is_free(first) || second.frame() == first);
        assert!(second.flags().contains(PteFlags::SHARE));
        let mut byte = [0xffu8];
        assert!(kernel.peek(root, va(0x1000), &mut byte));
        assert_eq!(byte[0], 0);
    }

    #[test]
    fn page_alloc_does_not_leak_when_table_cannot_be_built() {
        let (mut kernel, root) = boot(32);
        // Leave exactly one frame: the data page takes it and the new table cannot be built.
        while kernel.frames().free_frames() > 1 {
            kernel.frames.alloc(crate::mm::AllocFlags::empty()).unwrap();
        }
        assert_eq!(
            kernel.sys_page_alloc(root, root, va(0x4000_0000), RW),
            Err(SysError::NoMemory)
        );
        assert_eq!(kernel.frames().free_frames(), 1);
    }

    #[test]
    fn page_map_shares_frame_and_counts_reference() {
        let (mut kernel, root) = boot(32);
        let child = kernel.sys_exofork(root).unwrap();
        kernel.sys_page_alloc(root, root, va(0x2000), RW).unwrap();
        kernel.sys_page_map(root, root, va(0x2000), child, va(0x3000), RO).unwrap();

        let parent_pte = kernel.page_entry(root, va(0x2000)).unwrap();
        let child_pte = kernel.page_entry(child, va(0x3000)).unwrap();
        assert_eq!(parent_pte.frame(), child_pte.frame());
        assert_eq!(child_pte.flags(), RO);
        assert_eq!(kernel.frames().refcount(parent_pte.frame()), 2);
    }

    #[test]
    fn page_map_reports_exhausted_refcount_as_no_memory() {
        let (mut kernel, root) = boot(32);
        kernel.sys_page_alloc(root, root, va(0x2000), RO).unwrap();
        let frame = kernel.page_entry(root, va(0x2000)).unwrap().frame();
        kernel.frames.set_refcount(frame, u32::MAX);

        assert_eq!(
            kernel.sys_page_map(root, root, va(0x2000), root, va(0x3000), RO),
            Err(SysError::NoMemory)
        );
        assert!(!kernel.page_entry(root, va(0x3000)).is_some_and(|pte| pte.is_present()));
        assert_eq!(kernel.frames().refcount(frame), u32::MAX);
    }

    #[test]
    fn page_map_rejects_widening_and_leaves_target_untouched() {
        let (mut kernel, root) = boot(32);
        let child = kernel.sys_exofork(root).unwrap();
        kernel.sys_page_alloc(root, root, va(0x2000), RO).unwrap();

        assert_eq!(
            kernel.sys_page_map(root, root, va(0x2000), child, va(0x2000), RW),
            Err(SysError::InvalidArgument)
        );
        assert!(kernel.page_entry(child, va(0x2000)).is_none());
        assert_eq!(
            kernel.sys_page_map(root, root, va(0x9000), child, va(0x2000), RO),
            Err(SysError::InvalidArgument)
        );
    }

    #[test]
    fn unmap_is_idempotent() {
        let (mut kernel, root) = boot(32);
        kernel.sys_page_unmap(root, root, va(0x6000)).unwrap();
        kernel.sys_page_alloc(root, root, va(0x6000), RW).unwrap();
        let frame = kernel.page_entry(root, va(0x6000)).unwrap().frame();
        kernel.sys_page_unmap(root, root, va(0x6000)).unwrap();
        kernel.sys_page_unmap(root, root, va(0x6000)).unwrap();
        assert!(kernel.frames().is_free(frame));
        assert!(!kernel.page_entry(root, va(0x6000)).unwrap().is_present());
        assert_eq!(kernel.sys_page_unmap(root, root, va(0x6004)), Err(SysError::InvalidArgument));
    }

    #[test]
    fn destroying_a_child_frees_everything() {
        let (mut kernel, root) = boot(32);
        let before = kernel.frames().free_frames();
        let child = kernel.sys_exofork(root).unwrap();
        kernel.sys_page_alloc(root, child, va(0x1000), RW).unwrap();
        kernel
            .sys_page_alloc(root, child, va(UTOP - PAGE_SIZE as u32), RW)
            .unwrap();
        kernel.sys_env_destroy(root, child).unwrap();
        assert_eq!(kernel.frames().free_frames(), before);
        assert!(kernel.env_info(child).is_none());
        assert_eq!(kernel.sys_page_alloc(root, child, va(0x1000), RW), Err(SysError::BadTarget));
    }

    #[test]
    fn self_destroy_lingers_until_reaped() {
        let (mut kernel, root) = boot(32);
        kernel.sys_env_destroy(root, EnvId::SELF).unwrap();
        assert_eq!(kernel.env_info(root).unwrap().status, EnvStatus::Dying);
        assert_eq!(kernel.sched_yield(), None);
        assert!(kernel.env_info(root).is_none());
        assert_eq!(kernel.frames().free_frames(), 32);
    }

    #[test]
    fn set_trapframe_forces_user_mode() {
        let (mut kernel, root) = boot(32);
        let child = kernel.sys_exofork(root).unwrap();
        let mut tf = Trapframe::user(0x0080_4000, 0x1234);
        tf.cs = 0x08;
        tf.eflags = 0;
        kernel.sys_env_set_trapframe(root, child, &tf).unwrap();
        let saved = kernel.trapframe(child).unwrap();
        assert_eq!(saved.cs, GD_UT);
        assert_eq!(saved.eflags & FL_IF, FL_IF);
        assert_eq!(saved.eip, 0x0080_4000);
    }
}
