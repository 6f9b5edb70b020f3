// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write repair handler
//! OWNERS: @runtime
//! PUBLIC API: pgfault (UpcallEntry)
//! DEPENDS_ON: cortex_abi::{Syscalls, UserMemory}
//! INVARIANTS: Only write faults on COW pages are repaired; every other fault,
//!             and every failure during repair, terminates the environment

use cortex_abi::layout::{PAGE_SIZE, PFTEMP};
use cortex_abi::{EnvId, FaultCode, PteFlags, UTrapframe, UserEnv, UserPanic, VirtAddr};

const SCRATCH: VirtAddr = VirtAddr::new(PFTEMP);

/// Replaces the faulting COW page with a private writable copy.
pub fn pgfault(env: &mut dyn UserEnv, utf: &UTrapframe) -> Result<(), UserPanic> {
    let va = utf.va().round_down();
    if !utf.code().contains(FaultCode::WRITE) {
        return Err(UserPanic::new("pgfault: not a write fault"));
    }
    let cow = env
        .page_entry(va)
        .is_some_and(|pte| pte.is_present() && pte.flags().contains(PteFlags::COW));
    if !cow {
        return Err(UserPanic::new("pgfault: write to a non-COW page"));
    }

    env.page_alloc(EnvId::SELF, SCRATCH, PteFlags::USER_RW)
        .map_err(|err| UserPanic::caused_by("pgfault: page_alloc", err))?;
    let mut page = [0u8; PAGE_SIZE];
    env.load(va, &mut page)
        .map_err(|_| UserPanic::new("pgfault: faulting page unreadable"))?;
    env.store(SCRATCH, &page)
        .map_err(|_| UserPanic::new("pgfault: scratch page unwritable"))?;
    env.page_unmap(EnvId::SELF, va)
        .map_err(|err| UserPanic::caused_by("pgfault: page_unmap", err))?;
    env.page_map(EnvId::SELF, SCRATCH, EnvId::SELF, va, PteFlags::USER_RW)
        .map_err(|err| UserPanic::caused_by("pgfault: page_map", err))?;
    env.page_unmap(EnvId::SELF, SCRATCH)
        .map_err(|err| UserPanic::caused_by("pgfault: page_unmap scratch", err))?;

    log::trace!(target: "fork", "[{}] cow repaired {:?}", env.getenvid(), va);
    Ok(())
}
