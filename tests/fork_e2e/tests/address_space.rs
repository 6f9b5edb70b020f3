// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space syscall scenarios seen from user environments
//! INTENT: Argument errors never change state; unmapping is idempotent everywhere
//! DEPS: cortex (kernel model)
//! TESTS: unaligned alloc keeps the pool, map widening leaves target untouched,
//!        unmap idempotence for arbitrary addresses and target states

use cortex_abi::layout::UTOP;
use cortex_abi::{EnvId, EnvStatus, PteFlags, SysError, Syscalls, VirtAddr};
use fork_e2e::{assert_consistent, boot, run};
use proptest::prelude::*;

#[test]
fn unaligned_alloc_is_rejected_without_using_memory() {
    let (mut kernel, env) = boot(64);
    let free = kernel.frames().free_frames();
    let err = run(&mut kernel, env, |ctx| {
        ctx.page_alloc(EnvId::SELF, VirtAddr::new(0x1001), PteFlags::USER_RW)
    });
    assert_eq!(err, Err(SysError::InvalidArgument));
    assert_eq!(kernel.frames().free_frames(), free);
}

#[test]
fn map_cannot_widen_read_only_source() {
    let (mut kernel, parent) = boot(64);
    let child = run(&mut kernel, parent, |ctx| {
        let child = ctx.exofork().unwrap();
        ctx.page_alloc(EnvId::SELF, VirtAddr::new(0x1000), PteFlags::USER_PRESENT).unwrap();
        child
    });
    let target_before = kernel.page_entry(child, VirtAddr::new(0x3000));
    let err = run(&mut kernel, parent, |ctx| {
        ctx.page_map(
            EnvId::SELF,
            VirtAddr::new(0x1000),
            child,
            VirtAddr::new(0x3000),
            PteFlags::USER_RW,
        )
    });
    assert_eq!(err, Err(SysError::InvalidArgument));
    assert_eq!(kernel.page_entry(child, VirtAddr::new(0x3000)), target_before);
    assert_consistent(&kernel);
}

#[test]
fn bad_target_is_reported_before_bad_arguments() {
    let (mut kernel, env) = boot(64);
    let err = run(&mut kernel, env, |ctx| {
        ctx.page_alloc(EnvId::from_raw(0x0000_7c03), VirtAddr::new(0x1001), PteFlags::empty())
    });
    assert_eq!(err, Err(SysError::BadTarget));
}

fn arb_va() -> impl Strategy<Value = u32> {
    prop_oneof![
        (0u32..64).prop_map(|page| page * 0x1000),
        any::<u32>().prop_map(|raw| raw & !0xfff).prop_filter("user", |va| *va < UTOP),
    ]
}

proptest! {
    #[test]
    fn unmap_twice_is_a_noop(va in arb_va(), mapped in any::<bool>(), blocked in any::<bool>()) {
        let (mut kernel, parent) = boot(64);
        let child = run(&mut kernel, parent, |ctx| ctx.exofork().unwrap());
        let status = if blocked { EnvStatus::NotRunnable } else { EnvStatus::Runnable };
        let va = VirtAddr::new(va);
        run(&mut kernel, parent, |ctx| {
            ctx.env_set_status(child, status).unwrap();
            if mapped {
                ctx.page_alloc(child, va, PteFlags::USER_RW).unwrap();
            }
            prop_assert_eq!(ctx.page_unmap(child, va), Ok(()));
            prop_assert_eq!(ctx.page_unmap(child, va), Ok(()));
            Ok(())
        })?;
        prop_assert!(kernel.page_entry(child, va).map_or(true, |pte| !pte.is_present()));
        prop_assert!(cortex::check_all(&kernel).is_empty());
    }
}
