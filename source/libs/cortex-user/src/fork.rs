// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write replication engine (fork, sfork, share-region fork)
//! OWNERS: @runtime
//! PUBLIC API: fork, sfork, fork_with(ForkPolicy), duppage, child_entry
//! DEPENDS_ON: cow::pgfault, pgfault::set_pgfault_handler, cortex_abi::UserEnv
//! INVARIANTS: Replicates [0, UXSTACKTOP - PAGE_SIZE) except PFTEMP; SHARE pages are never COW;
//!             the child's exception stack is a fresh frame filled through a scratch mapping;
//!             no rollback on failure, the child stays NotRunnable

use cortex_abi::layout::{PAGE_SIZE, PFTEMP, PT_SPAN, USTACKTOP};
use cortex_abi::{EnvId, EnvInfo, EnvStatus, PteFlags, SysError, SysResult, UserEnv, VirtAddr};

use crate::cow;
use crate::error::ForkError;
use crate::pgfault::{set_pgfault_handler, UXSTACK_PAGE};

const SCRATCH: VirtAddr = VirtAddr::new(PFTEMP);
const USTACK_PAGE: u32 = USTACKTOP - PAGE_SIZE as u32;

/// Per-page classification used while replicating an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkPolicy {
    /// Every private page becomes COW in both environments.
    CopyOnWrite,
    /// Share every page except the normal user stack, which is COW.
    ShareExceptStack,
    /// Share pages in `[start, end)`; everything else is COW.
    ShareRegion {
        /// First shared address (inclusive).
        start: u32,
        /// End of the shared range (exclusive).
        end: u32,
    },
}

impl ForkPolicy {
    /// Whether the page at `va` is shared as-is instead of made COW.
    pub fn shares(&self, va: VirtAddr) -> bool {
        match *self {
            Self::CopyOnWrite => false,
            Self::ShareExceptStack => va.raw() != USTACK_PAGE,
            Self::ShareRegion { start, end } => (start..end).contains(&va.raw()),
        }
    }
}

/// Forks with copy-on-write for every private page.
pub fn fork(env: &mut dyn UserEnv) -> Result<EnvId, ForkError> {
    fork_with(env, ForkPolicy::CopyOnWrite)
}

/// Forks sharing the whole address space except the user stack.
pub fn sfork(env: &mut dyn UserEnv) -> Result<EnvId, ForkError> {
    fork_with(env, ForkPolicy::ShareExceptStack)
}

/// Replicates the calling environment into a new runnable child and returns its id.
///
/// The child resumes with `eax == 0`; its host runs [`child_entry`] first.
pub fn fork_with(env: &mut dyn UserEnv, policy: ForkPolicy) -> Result<EnvId, ForkError> {
    set_pgfault_handler(env, cow::pgfault).map_err(ForkError::Handler)?;
    let child = env.exofork().map_err(ForkError::Exofork)?;
    log::debug!(target: "fork", "[{}] fork -> {} ({:?})", env.getenvid(), child, policy);

    let limit = UXSTACK_PAGE.raw();
    let mut va = 0u32;
    while va < limit {
        let addr = VirtAddr::new(va);
        if !env.table_present(addr) {
            // Skip the rest of an absent page table.
            va = (va & !(PT_SPAN - 1)).saturating_add(PT_SPAN);
            continue;
        }
        if va != PFTEMP {
            duppage(env, child, addr, policy)
                .map_err(|source| ForkError::Duppage { va: addr, source })?;
        }
        va += PAGE_SIZE as u32;
    }

    env.page_alloc(child, UXSTACK_PAGE, PteFlags::USER_RW)
        .map_err(ForkError::ExceptionStack)?;
    copy_exception_stack(env, child)?;
    env.env_set_pgfault_upcall(child, cow::pgfault).map_err(ForkError::Upcall)?;
    env.env_set_status(child, EnvStatus::Runnable).map_err(ForkError::Status)?;
    Ok(child)
}

/// Duplicates the mapping at `va` (if any) into `child` according to `policy`.
pub fn duppage(
    env: &mut dyn UserEnv,
    child: EnvId,
    va: VirtAddr,
    policy: ForkPolicy,
) -> SysResult<()> {
    let Some(pte) = env.page_entry(va).filter(|pte| pte.is_present()) else {
        return Ok(());
    };
    let perm = pte.flags() & PteFlags::SYSCALL;

    if perm.contains(PteFlags::SHARE) {
        return env.page_map(EnvId::SELF, va, child, va, perm);
    }
    if policy.shares(va) {
        if !perm.contains(PteFlags::WRITABLE) {
            return env.page_map(EnvId::SELF, va, child, va, perm);
        }
        // Writable sharing is only legal once the page is marked SHARE.
        let shared = perm | PteFlags::SHARE;
        env.page_map(EnvId::SELF, va, EnvId::SELF, va, shared)?;
        return env.page_map(EnvId::SELF, va, child, va, shared);
    }
    if perm.intersects(PteFlags::WRITABLE | PteFlags::COW) {
        let cow = PteFlags::USER_PRESENT | PteFlags::COW;
        env.page_map(EnvId::SELF, va, child, va, cow)?;
        // Re-assert COW on our own mapping even if it already was.
        return env.page_map(EnvId::SELF, va, EnvId::SELF, va, cow);
    }
    env.page_map(EnvId::SELF, va, child, va, perm)
}

/// Fills the child's fresh exception stack with a copy of ours through the scratch page.
fn copy_exception_stack(env: &mut dyn UserEnv, child: EnvId) -> Result<(), ForkError> {
    env.page_map(child, UXSTACK_PAGE, EnvId::SELF, SCRATCH, PteFlags::USER_RW)
        .map_err(ForkError::ExceptionStack)?;
    let mut page = [0u8; PAGE_SIZE];
    env.load(UXSTACK_PAGE, &mut page).map_err(ForkError::StackCopy)?;
    env.store(SCRATCH, &page).map_err(ForkError::StackCopy)?;
    env.page_unmap(EnvId::SELF, SCRATCH).map_err(ForkError::ExceptionStack)
}

/// First thing a freshly forked child runs: re-resolves its own environment record.
pub fn child_entry(env: &dyn UserEnv) -> SysResult<EnvInfo> {
    let me = env.env_info(EnvId::SELF).ok_or(SysError::BadTarget)?;
    log::debug!(target: "fork", "[{}] child running (parent {:?})", me.id, me.parent);
    Ok(me)
}
