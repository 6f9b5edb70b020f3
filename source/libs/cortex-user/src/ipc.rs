// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rendezvous IPC wrappers
//! OWNERS: @runtime
//! PUBLIC API: send, recv -> Blocked, Received, SEND_RETRY_LIMIT
//! DEPENDS_ON: cortex_abi::Syscalls
//! INVARIANTS: send only retries TargetNotReceiving, yielding between attempts,
//!             and stops as soon as the sender loses the CPU;
//!             a receive completes when the kernel clears ipc_recving

use cortex_abi::layout::UTOP;
use cortex_abi::{EnvId, EnvStatus, PteFlags, SysError, SysResult, Syscalls, UserEnv, VirtAddr};

/// Attempts made by [`send`] before giving up with `TargetNotReceiving`.
pub const SEND_RETRY_LIMIT: u32 = 256;

const NO_PAGE: VirtAddr = VirtAddr::new(UTOP);

/// Sends `value` (and optionally the page at `page.0` with permissions `page.1`) to `to`.
///
/// Yields after each refused attempt. If yielding hands the CPU to another
/// environment the loop stops with `TargetNotReceiving`; the sender calls again
/// once it is scheduled.
pub fn send(
    env: &mut dyn UserEnv,
    to: EnvId,
    value: u32,
    page: Option<(VirtAddr, PteFlags)>,
) -> SysResult<()> {
    let (srcva, perm) = page.unwrap_or((NO_PAGE, PteFlags::empty()));
    for attempt in 1..=SEND_RETRY_LIMIT {
        match env.ipc_try_send(to, value, srcva, perm) {
            Err(SysError::TargetNotReceiving) if attempt < SEND_RETRY_LIMIT => {
                env.yield_cpu();
                if !still_running(env) {
                    log::debug!(target: "ipc", "send to {} preempted after {} attempts", to, attempt);
                    return Err(SysError::TargetNotReceiving);
                }
            }
            other => return other,
        }
    }
    Err(SysError::TargetNotReceiving)
}

fn still_running(env: &dyn UserEnv) -> bool {
    env.env_info(EnvId::SELF).is_some_and(|info| info.status == EnvStatus::Running)
}

/// A receive that is waiting for a sender.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blocked {
    dstva: Option<VirtAddr>,
}

/// What a completed receive delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Sender.
    pub from: EnvId,
    /// Word sent along.
    pub value: u32,
    /// Permissions of the transferred page; empty when no page arrived.
    pub perm: PteFlags,
}

impl Blocked {
    /// Address the receive asked a page to be mapped at.
    pub fn dstva(&self) -> Option<VirtAddr> {
        self.dstva
    }

    /// Reads the delivery once the environment runs again; `None` while still waiting.
    pub fn complete(&self, env: &dyn Syscalls) -> Option<Received> {
        let info = env.env_info(EnvId::SELF)?;
        if info.ipc_recving {
            return None;
        }
        Some(Received { from: info.ipc_from?, value: info.ipc_value, perm: info.ipc_perm })
    }
}

/// Blocks the calling environment until a sender arrives.
///
/// With `page`, a transferred page is mapped there. The CPU is given away; the
/// delivery is read with [`Blocked::complete`] after the environment is scheduled again.
pub fn recv(env: &mut dyn UserEnv, page: Option<VirtAddr>) -> SysResult<Blocked> {
    env.ipc_recv(page.unwrap_or(NO_PAGE))?;
    Ok(Blocked { dstva: page })
}
