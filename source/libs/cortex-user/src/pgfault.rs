// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault handler installation.

use cortex_abi::layout::{PAGE_SIZE, UXSTACKTOP};
use cortex_abi::{EnvId, PteFlags, SysResult, UpcallEntry, UserEnv, VirtAddr};

/// Page holding the user exception stack.
pub const UXSTACK_PAGE: VirtAddr = VirtAddr::new(UXSTACKTOP - PAGE_SIZE as u32);

/// Installs `handler` as the fault upcall of the calling environment.
///
/// The exception stack is allocated on first installation and kept afterwards,
/// so installing again (or installing another handler) is cheap.
pub fn set_pgfault_handler(env: &mut dyn UserEnv, handler: UpcallEntry) -> SysResult<()> {
    let mapped = env.page_entry(UXSTACK_PAGE).is_some_and(|pte| pte.is_present());
    if !mapped {
        env.page_alloc(EnvId::SELF, UXSTACK_PAGE, PteFlags::USER_RW)?;
        log::debug!(target: "fork", "[{}] exception stack allocated", env.getenvid());
    }
    env.env_set_pgfault_upcall(EnvId::SELF, handler)
}
