// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Syscall numbering and the user → kernel seam.
//!
//! [`Syscalls`] is what a user environment can ask the kernel for; [`UserMemory`] is what
//! it can touch directly. The kernel model implements both for a running environment,
//! and the user runtime (fork, COW repair, IPC wrappers) is written against them.

use crate::env::{EnvId, EnvInfo, EnvStatus};
use crate::error::{MemoryFault, SysResult, UserPanic};
use crate::layout::VirtAddr;
use crate::pte::{Pte, PteFlags};
use crate::trapframe::{Trapframe, UTrapframe};

/// Stable syscall numbers (register `eax` on entry).
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyscallNumber {
    /// `() -> EnvId`
    GetEnvId = 0,
    /// `(env)`
    EnvDestroy = 1,
    /// `()`
    Yield = 2,
    /// `() -> EnvId`
    Exofork = 3,
    /// `(env, status)`
    EnvSetStatus = 4,
    /// `(env, tf_va)`; the frame is read from caller memory in its encoded form.
    EnvSetTrapframe = 5,
    /// `(env, upcall_addr)`
    EnvSetPgfaultUpcall = 6,
    /// `(env, va, perm)`
    PageAlloc = 7,
    /// `(srcenv, srcva, dstenv, dstva, perm)`
    PageMap = 8,
    /// `(env, va)`
    PageUnmap = 9,
    /// `(env, value, srcva, perm)`
    IpcTrySend = 10,
    /// `(dstva)`
    IpcRecv = 11,
}

impl SyscallNumber {
    /// Number of defined syscalls.
    pub const COUNT: usize = 12;
}

impl TryFrom<u32> for SyscallNumber {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::GetEnvId,
            1 => Self::EnvDestroy,
            2 => Self::Yield,
            3 => Self::Exofork,
            4 => Self::EnvSetStatus,
            5 => Self::EnvSetTrapframe,
            6 => Self::EnvSetPgfaultUpcall,
            7 => Self::PageAlloc,
            8 => Self::PageMap,
            9 => Self::PageUnmap,
            10 => Self::IpcTrySend,
            11 => Self::IpcRecv,
            other => return Err(other),
        })
    }
}

/// User "code address" of a registered upcall entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct UpcallAddr(pub u32);

/// Fault upcall: runs on the exception stack with the decoded fault record.
///
/// Returning `Err` terminates the environment; returning `Ok` resumes the
/// faulting access.
pub type UpcallEntry = fn(&mut dyn UserEnv, &UTrapframe) -> Result<(), UserPanic>;

/// Kernel services available to a running environment.
///
/// Every target-taking call accepts [`EnvId::SELF`] for the caller.
pub trait Syscalls {
    /// Handle of the calling environment.
    fn getenvid(&self) -> EnvId;

    /// Read-only view of any live environment (`None` if free or stale).
    fn env_info(&self, env: EnvId) -> Option<EnvInfo>;

    /// Read-only view of the caller's PTE for `va`, if its page table exists.
    fn page_entry(&self, va: VirtAddr) -> Option<Pte>;

    /// Whether the caller has a page table covering `va`.
    fn table_present(&self, va: VirtAddr) -> bool;

    /// Gives up the processor.
    fn yield_cpu(&mut self);

    /// Destroys `env` (the caller or one of its children).
    fn env_destroy(&mut self, env: EnvId) -> SysResult<()>;

    /// Creates a blank child whose first run returns zero from this call.
    fn exofork(&mut self) -> SysResult<EnvId>;

    /// Sets `env` to `Runnable` or `NotRunnable`.
    fn env_set_status(&mut self, env: EnvId, status: EnvStatus) -> SysResult<()>;

    /// Replaces the saved registers of `env`.
    fn env_set_trapframe(&mut self, env: EnvId, tf: &Trapframe) -> SysResult<()>;

    /// Records the fault upcall of `env`.
    fn env_set_pgfault_upcall(&mut self, env: EnvId, entry: UpcallEntry) -> SysResult<()>;

    /// Maps a fresh zeroed page at `va` in `env`.
    fn page_alloc(&mut self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()>;

    /// Maps the page at `srcva` in `src` at `dstva` in `dst`.
    fn page_map(
        &mut self,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()>;

    /// Unmaps `va` in `env`; a no-op if nothing is mapped there.
    fn page_unmap(&mut self, env: EnvId, va: VirtAddr) -> SysResult<()>;

    /// Hands `value` (and the page at `srcva` if below `UTOP`) to a receiving `env`.
    fn ipc_try_send(&mut self, env: EnvId, value: u32, srcva: VirtAddr, perm: PteFlags)
        -> SysResult<()>;

    /// Blocks until a sender arrives; a page is accepted at `dstva` if below `UTOP`.
    fn ipc_recv(&mut self, dstva: VirtAddr) -> SysResult<()>;
}

/// Ordinary user-mode loads and stores.
///
/// A fault is routed to the environment's upcall and the access retried.
pub trait UserMemory {
    /// Reads `buf.len()` bytes at `va`.
    fn load(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemoryFault>;

    /// Writes `data` at `va`.
    fn store(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), MemoryFault>;
}

/// A running user environment.
pub trait UserEnv: Syscalls + UserMemory {}

impl<T: Syscalls + UserMemory + ?Sized> UserEnv for T {}
