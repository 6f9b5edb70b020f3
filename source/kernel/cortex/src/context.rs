// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Syscall and memory-access context of the running environment.

extern crate alloc;

use core::marker::PhantomData;

use cortex_abi::layout::PAGE_SIZE;
use cortex_abi::{
    EnvId, EnvInfo, EnvStatus, FrameNumber, MemoryFault, Pte, PteFlags, SysError, SysResult,
    Syscalls, Trapframe, UpcallEntry, UserMemory, VirtAddr,
};

use crate::kernel::Kernel;
use crate::mm::{self, Access};
use crate::syscall::Args;

/// The CPU as seen by the environment it is running.
///
/// Obtained from [`Kernel::enter`]. Every call first checks that `env` still
/// holds the CPU; after it blocks, yields away or dies, calls fail with `BadTarget`.
pub struct UserContext<'k> {
    kernel: &'k mut Kernel,
    env: EnvId,
    // Borrowed for one stretch of execution on one CPU.
    _not_send_sync: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(UserContext<'static>: Send, Sync);

impl<'k> UserContext<'k> {
    pub(crate) fn new(kernel: &'k mut Kernel, env: EnvId) -> Self {
        Self { kernel, env, _not_send_sync: PhantomData }
    }

    /// Environment this context runs.
    pub fn env(&self) -> EnvId {
        self.env
    }

    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }

    /// Whether the environment still holds the CPU.
    pub fn is_running(&self) -> bool {
        self.kernel.current == Some(self.env)
            && self.kernel.envs.find(self.env).is_some_and(|env| env.is_alive())
    }

    pub(crate) fn kernel_mut(&mut self) -> &mut Kernel {
        self.kernel
    }

    /// The running environment, or `BadTarget` once it lost the CPU.
    pub(crate) fn caller(&self) -> SysResult<EnvId> {
        if self.is_running() {
            Ok(self.env)
        } else {
            Err(SysError::BadTarget)
        }
    }

    /// Register-level syscall entry: `eax = number`, arguments in `edx, ecx, ebx, edi, esi`.
    ///
    /// Returns the value left in `eax`: non-negative on success, a negated error code otherwise.
    pub fn syscall(&mut self, number: u32, args: [u32; 5]) -> i32 {
        let args = Args::new(args);
        let result = match self.kernel.syscalls.handler(number) {
            Some(handler) => handler(self, &args),
            None => Err(SysError::InvalidArgument),
        };
        if let Err(err) = result {
            log::debug!(target: "env", "[{}] syscall {} -> {}", self.env, number, err);
        }
        SysError::encode(result)
    }

    /// Copies user memory into the kernel without delivering faults.
    pub(crate) fn copy_in(&mut self, va: VirtAddr, buf: &mut [u8]) -> SysResult<()> {
        let caller = self.caller()?;
        if self.kernel.peek(caller, va, buf) {
            Ok(())
        } else {
            Err(SysError::InvalidArgument)
        }
    }

    /// Translates one user access, routing faults to the upcall and retrying.
    fn translate(&mut self, va: VirtAddr, access: Access) -> Result<FrameNumber, MemoryFault> {
        let limit = self.kernel.config.fault_retry_limit;
        let mut faults = 0u32;
        loop {
            if !self.is_running() {
                return Err(MemoryFault::NotRunning(self.env));
            }
            let slot = self.env.slot();
            let kernel = &mut *self.kernel;
            let Some(pgdir) = kernel.envs.get_mut(slot).pgdir.as_mut() else {
                return Err(MemoryFault::NotRunning(self.env));
            };
            let code = match mm::translate(pgdir, &mut kernel.tlb, slot, va, access) {
                Ok(frame) => return Ok(frame),
                Err(code) => code,
            };
            faults += 1;
            if faults > limit {
                log::warn!(target: "trap", "[{}] access at {:?} keeps faulting", self.env, va);
                kernel.destroy(slot);
                return Err(MemoryFault::Killed { env: self.env, va });
            }
            kernel.page_fault(self.env, va, code)?;
        }
    }

    /// Splits `[va, va + len)` into per-page pieces and runs `f` on each.
    fn for_each_page(
        &mut self,
        va: VirtAddr,
        len: usize,
        access: Access,
        mut f: impl FnMut(&mut Kernel, FrameNumber, usize, core::ops::Range<usize>),
    ) -> Result<(), MemoryFault> {
        let mut done = 0usize;
        while done < len {
            let addr = va
                .checked_add(done as u32)
                .ok_or(MemoryFault::Killed { env: self.env, va })?;
            let off = addr.page_offset();
            let chunk = (PAGE_SIZE - off).min(len - done);
            let frame = self.translate(addr, access)?;
            f(&mut *self.kernel, frame, off, done..done + chunk);
            done += chunk;
        }
        Ok(())
    }
}

impl UserMemory for UserContext<'_> {
    fn load(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemoryFault> {
        let len = buf.len();
        self.for_each_page(va, len, Access::Read, |kernel, frame, off, range| {
            let bytes = kernel.frames.bytes(frame);
            buf[range.clone()].copy_from_slice(&bytes[off..off + range.len()]);
        })
    }

    fn store(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), MemoryFault> {
        self.for_each_page(va, data.len(), Access::Write, |kernel, frame, off, range| {
            if let Some(bytes) = kernel.frames.bytes_mut(frame) {
                bytes[off..off + range.len()].copy_from_slice(&data[range]);
            }
        })
    }
}

impl Syscalls for UserContext<'_> {
    fn getenvid(&self) -> EnvId {
        self.env
    }

    fn env_info(&self, env: EnvId) -> Option<EnvInfo> {
        let env = if env.is_self() { self.env } else { env };
        self.kernel.env_info(env)
    }

    fn page_entry(&self, va: VirtAddr) -> Option<Pte> {
        self.kernel.page_entry(self.env, va)
    }

    fn table_present(&self, va: VirtAddr) -> bool {
        self.kernel
            .envs
            .find(self.env)
            .and_then(|env| env.pgdir.as_ref())
            .is_some_and(|pgdir| pgdir.table_present(va))
    }

    fn yield_cpu(&mut self) {
        if self.is_running() {
            self.kernel.sched_yield();
        }
    }

    fn env_destroy(&mut self, env: EnvId) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_env_destroy(caller, env)
    }

    fn exofork(&mut self) -> SysResult<EnvId> {
        let caller = self.caller()?;
        self.kernel.sys_exofork(caller)
    }

    fn env_set_status(&mut self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_env_set_status(caller, env, status)
    }

    fn env_set_trapframe(&mut self, env: EnvId, tf: &Trapframe) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_env_set_trapframe(caller, env, tf)
    }

    fn env_set_pgfault_upcall(&mut self, env: EnvId, entry: UpcallEntry) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_env_set_pgfault_upcall(caller, env, entry)
    }

    fn page_alloc(&mut self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_page_alloc(caller, env, va, perm)
    }

    fn page_map(
        &mut self,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_page_map(caller, src, srcva, dst, dstva, perm)
    }

    fn page_unmap(&mut self, env: EnvId, va: VirtAddr) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_page_unmap(caller, env, va)
    }

    fn ipc_try_send(
        &mut self,
        env: EnvId,
        value: u32,
        srcva: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_ipc_try_send(caller, env, value, srcva, perm)
    }

    fn ipc_recv(&mut self, dstva: VirtAddr) -> SysResult<()> {
        let caller = self.caller()?;
        self.kernel.sys_ipc_recv(caller, dstva)
    }
}
