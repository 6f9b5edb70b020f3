// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table)
//! DEPENDS_ON: context::UserContext, Kernel::sys_* operations
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; decode/check only validate
//!             register structure so that a bad target is always reported before bad arguments

use cortex_abi::trapframe::TRAPFRAME_SIZE;
use cortex_abi::{
    EnvId, EnvStatus, PteFlags, SysError, SyscallNumber, Syscalls, Trapframe, UpcallAddr, VirtAddr,
};

use super::{Args, SysResult, SyscallTable};
use crate::context::UserContext;

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone)]
struct EnvArgsTyped {
    env: EnvId,
}

impl EnvArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, SysError> {
        Ok(Self { env: EnvId::from_raw(args.get(0)) })
    }
}

#[derive(Copy, Clone)]
struct SetStatusArgsTyped {
    env: EnvId,
    status: u32,
}

impl SetStatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, SysError> {
        Ok(Self { env: EnvId::from_raw(args.get(0)), status: args.get(1) })
    }
    /// Only the two schedulable states may be requested.
    #[inline]
    fn check(&self) -> Result<EnvStatus, SysError> {
        match EnvStatus::try_from(self.status) {
            Ok(status @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => Ok(status),
            _ => Err(SysError::InvalidArgument),
        }
    }
}

#[derive(Copy, Clone)]
struct SetTrapframeArgsTyped {
    env: EnvId,
    tf_va: VirtAddr,
}

impl SetTrapframeArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, SysError> {
        Ok(Self { env: EnvId::from_raw(args.get(0)), tf_va: VirtAddr::new(args.get(1)) })
    }
    #[inline]
    fn check(&self) -> Result<(), SysError> {
        // The whole frame must sit below UTOP.
        match self.tf_va.checked_add(TRAPFRAME_SIZE as u32 - 1) {
            Some(end) if end.is_user() => Ok(()),
            _ => Err(SysError::InvalidArgument),
        }
    }
}

#[derive(Copy, Clone)]
struct UpcallArgsTyped {
    env: EnvId,
    addr: UpcallAddr,
}

impl UpcallArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, SysError> {
        Ok(Self { env: EnvId::from_raw(args.get(0)), addr: UpcallAddr(args.get(1)) })
    }
}

#[derive(Copy, Clone)]
struct PageArgsTyped {
    env: EnvId,
    va: VirtAddr,
    perm: PteFlags,
}

impl PageArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, SysError> {
        Ok(Self {
            env: EnvId::from_raw(args.get(0)),
            va: VirtAddr::new(args.get(1)),
            perm: PteFlags::from_bits_retain(args.get(2)),
        })
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src: EnvId,
    srcva: VirtAddr,
    dst: EnvId,
    dstva: VirtAddr,
    perm: PteFlags,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, SysError> {
        Ok(Self {
            src: EnvId::from_raw(args.get(0)),
            srcva: VirtAddr::new(args.get(1)),
            dst: EnvId::from_raw(args.get(2)),
            dstva: VirtAddr::new(args.get(3)),
            perm: PteFlags::from_bits_retain(args.get(4)),
        })
    }
}

#[derive(Copy, Clone)]
struct TrySendArgsTyped {
    env: EnvId,
    value: u32,
    srcva: VirtAddr,
    perm: PteFlags,
}

impl TrySendArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, SysError> {
        Ok(Self {
            env: EnvId::from_raw(args.get(0)),
            value: args.get(1),
            srcva: VirtAddr::new(args.get(2)),
            perm: PteFlags::from_bits_retain(args.get(3)),
        })
    }
}

/// Registers the full syscall set.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SyscallNumber::GetEnvId, sys_getenvid);
    table.register(SyscallNumber::EnvDestroy, sys_env_destroy);
    table.register(SyscallNumber::Yield, sys_yield);
    table.register(SyscallNumber::Exofork, sys_exofork);
    table.register(SyscallNumber::EnvSetStatus, sys_env_set_status);
    table.register(SyscallNumber::EnvSetTrapframe, sys_env_set_trapframe);
    table.register(SyscallNumber::EnvSetPgfaultUpcall, sys_env_set_pgfault_upcall);
    table.register(SyscallNumber::PageAlloc, sys_page_alloc);
    table.register(SyscallNumber::PageMap, sys_page_map);
    table.register(SyscallNumber::PageUnmap, sys_page_unmap);
    table.register(SyscallNumber::IpcTrySend, sys_ipc_try_send);
    table.register(SyscallNumber::IpcRecv, sys_ipc_recv);
}

fn sys_getenvid(ctx: &mut UserContext<'_>, _args: &Args) -> SysResult<u32> {
    ctx.caller().map(EnvId::as_raw)
}

fn sys_env_destroy(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    let typed = EnvArgsTyped::decode(args)?;
    ctx.env_destroy(typed.env)?;
    Ok(0)
}

fn sys_yield(ctx: &mut UserContext<'_>, _args: &Args) -> SysResult<u32> {
    ctx.caller()?;
    ctx.yield_cpu();
    Ok(0)
}

fn sys_exofork(ctx: &mut UserContext<'_>, _args: &Args) -> SysResult<u32> {
    ctx.exofork().map(EnvId::as_raw)
}

fn sys_env_set_status(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    let typed = SetStatusArgsTyped::decode(args)?;
    let caller = ctx.caller()?;
    ctx.kernel().envs.resolve(typed.env, caller, true)?;
    let status = typed.check()?;
    ctx.env_set_status(typed.env, status)?;
    Ok(0)
}

fn sys_env_set_trapframe(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    let typed = SetTrapframeArgsTyped::decode(args)?;
    let caller = ctx.caller()?;
    ctx.kernel().envs.resolve(typed.env, caller, true)?;
    typed.check()?;
    let mut raw = [0u8; TRAPFRAME_SIZE];
    ctx.copy_in(typed.tf_va, &mut raw)?;
    ctx.env_set_trapframe(typed.env, &Trapframe::from_le_bytes(&raw))?;
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    let typed = UpcallArgsTyped::decode(args)?;
    let caller = ctx.caller()?;
    ctx.kernel_mut().sys_env_set_pgfault_upcall_addr(caller, typed.env, typed.addr)?;
    Ok(0)
}

fn sys_page_alloc(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    let typed = PageArgsTyped::decode(args)?;
    ctx.page_alloc(typed.env, typed.va, typed.perm)?;
    Ok(0)
}

fn sys_page_map(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    let typed = PageMapArgsTyped::decode(args)?;
    ctx.page_map(typed.src, typed.srcva, typed.dst, typed.dstva, typed.perm)?;
    Ok(0)
}

fn sys_page_unmap(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    let typed = EnvArgsTyped::decode(args)?;
    ctx.page_unmap(typed.env, VirtAddr::new(args.get(1)))?;
    Ok(0)
}

fn sys_ipc_try_send(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    let typed = TrySendArgsTyped::decode(args)?;
    ctx.ipc_try_send(typed.env, typed.value, typed.srcva, typed.perm)?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut UserContext<'_>, args: &Args) -> SysResult<u32> {
    ctx.ipc_recv(VirtAddr::new(args.get(0)))?;
    Ok(0)
}
