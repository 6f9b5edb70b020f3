// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write fork scenarios across parent and child
//! INTENT: Writes after fork stay private; a repaired page never faults again
//! DEPS: cortex (kernel model), cortex-user (fork, COW repair)
//! TESTS: two-way isolation at 0x1000, repair idempotence, grandchildren, sfork sharing

use cortex_abi::{EnvId, EnvStatus, PteFlags, Syscalls, UserMemory, VirtAddr};
use cortex_user::{child_entry, fork, sfork};
use fork_e2e::{assert_consistent, boot, read_byte, run, write_byte};

const DATA: u32 = 0x1000;

fn parent_with_data(kernel: &mut cortex::Kernel, parent: EnvId, value: u8) -> EnvId {
    run(kernel, parent, |ctx| {
        ctx.page_alloc(EnvId::SELF, VirtAddr::new(DATA), PteFlags::USER_RW).unwrap();
        ctx.store(VirtAddr::new(DATA), &[value]).unwrap();
        fork(ctx).unwrap()
    })
}

#[test]
fn child_write_is_invisible_to_parent_and_back() {
    let (mut kernel, parent) = boot(128);
    let child = parent_with_data(&mut kernel, parent, 0x11);

    let me = run(&mut kernel, child, |ctx| child_entry(&*ctx).unwrap());
    assert_eq!(me.parent, Some(parent));
    assert_eq!(read_byte(&mut kernel, child, DATA), Ok(0x11));

    write_byte(&mut kernel, child, DATA, 0x22).unwrap();
    assert_eq!(read_byte(&mut kernel, parent, DATA), Ok(0x11));

    write_byte(&mut kernel, parent, DATA, 0x33).unwrap();
    assert_eq!(read_byte(&mut kernel, child, DATA), Ok(0x22));
    assert_eq!(read_byte(&mut kernel, parent, DATA), Ok(0x33));
    assert_consistent(&kernel);
}

#[test]
fn repaired_page_keeps_contents_and_does_not_fault_again() {
    let (mut kernel, parent) = boot(128);
    let child = parent_with_data(&mut kernel, parent, 0x5a);
    run(&mut kernel, child, |ctx| {
        let mut page = [0u8; 16];
        ctx.store(VirtAddr::new(DATA + 8), &[1]).unwrap();
        ctx.load(VirtAddr::new(DATA), &mut page).unwrap();
        assert_eq!(page[0], 0x5a);
        assert_eq!(page[8], 1);
    });
    let faults = kernel.env_info(child).unwrap().page_faults;
    write_byte(&mut kernel, child, DATA + 9, 2).unwrap();
    assert_eq!(kernel.env_info(child).unwrap().page_faults, faults);
    assert_eq!(kernel.env_info(child).unwrap().upcalls, 1);
}

#[test]
fn grandchild_inherits_cow_chain() {
    let (mut kernel, root) = boot(160);
    let child = parent_with_data(&mut kernel, root, 1);
    let grandchild = run(&mut kernel, child, |ctx| fork(ctx).unwrap());
    assert_eq!(kernel.env_info(grandchild).unwrap().parent, Some(child));

    write_byte(&mut kernel, grandchild, DATA, 3).unwrap();
    write_byte(&mut kernel, child, DATA, 2).unwrap();
    assert_eq!(read_byte(&mut kernel, root, DATA), Ok(1));
    assert_eq!(read_byte(&mut kernel, child, DATA), Ok(2));
    assert_eq!(read_byte(&mut kernel, grandchild, DATA), Ok(3));
    assert_consistent(&kernel);
}

#[test]
fn sfork_child_sees_parent_writes() {
    let (mut kernel, parent) = boot(128);
    let child = run(&mut kernel, parent, |ctx| {
        ctx.page_alloc(EnvId::SELF, VirtAddr::new(DATA), PteFlags::USER_RW).unwrap();
        sfork(ctx).unwrap()
    });
    write_byte(&mut kernel, parent, DATA, 0x77).unwrap();
    assert_eq!(read_byte(&mut kernel, child, DATA), Ok(0x77));
    assert_consistent(&kernel);
}

#[test]
fn destroying_the_child_returns_its_frames() {
    let (mut kernel, parent) = boot(128);
    let free_before = kernel.frames().free_frames();
    let child = parent_with_data(&mut kernel, parent, 9);
    write_byte(&mut kernel, child, DATA, 10).unwrap();
    run(&mut kernel, parent, |ctx| ctx.env_destroy(child).unwrap());
    assert!(kernel.env_info(child).is_none());
    assert_eq!(kernel.env_info(parent).unwrap().status, EnvStatus::Running);
    // The parent keeps its data page and exception stack, plus the tables for
    // the data page and for the scratch page used while forking.
    assert_eq!(kernel.frames().free_frames(), free_before - 4);
    assert_consistent(&kernel);
}
