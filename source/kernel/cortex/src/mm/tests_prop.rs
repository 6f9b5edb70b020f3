// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for frame accounting across address spaces
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Drives random syscall sequences and checks invariants.
//!
//! TEST_SCOPE:
//!   - Frame refcount equals live references after any Alloc/Map/Unmap/Exofork/Destroy sequence
//!   - Free list and refcount agree
//!   - Kernel-level mapping syscalls never create two private writable aliases of a frame
//!
//! TEST_SCENARIOS:
//!   - random_sequences_keep_invariants(): mixed ops over a small pool, checked after every step
//!   - destroy_everything_returns_every_frame(): tearing all environments down empties the pool usage

extern crate alloc;

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use cortex_abi::{EnvId, PteFlags, VirtAddr};
use proptest::prelude::*;

use crate::config::KernelConfig;
use crate::invariants::check_all;
use crate::kernel::Kernel;

#[derive(Clone, Debug)]
enum Op {
    Alloc { env: usize, page: u32, writable: bool },
    Map { src: usize, srcpage: u32, dst: usize, dstpage: u32, cow: bool },
    Unmap { env: usize, page: u32 },
    Exofork,
    Destroy { env: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..4, 0u32..24, any::<bool>())
            .prop_map(|(env, page, writable)| Op::Alloc { env, page, writable }),
        4 => (0usize..4, 0u32..24, 0usize..4, 0u32..24, any::<bool>())
            .prop_map(|(src, srcpage, dst, dstpage, cow)| Op::Map { src, srcpage, dst, dstpage, cow }),
        2 => (0usize..4, 0u32..24).prop_map(|(env, page)| Op::Unmap { env, page }),
        1 => Just(Op::Exofork),
        1 => (1usize..4).prop_map(|env| Op::Destroy { env }),
    ]
}

/// Pages are spread over two page tables.
fn page_va(page: u32) -> VirtAddr {
    VirtAddr::new(0x0040_0000 - 12 * 0x1000 + page * 0x1000)
}

fn pick(envs: &[EnvId], index: usize) -> EnvId {
    envs[index % envs.len()]
}

fn apply(kernel: &mut Kernel, root: EnvId, envs: &mut Vec<EnvId>, op: &Op) {
    match *op {
        Op::Alloc { env, page, writable } => {
            let perm = if writable { PteFlags::USER_RW } else { PteFlags::USER_PRESENT };
            let _ = kernel.sys_page_alloc(root, pick(envs, env), page_va(page), perm);
        }
        Op::Map { src, srcpage, dst, dstpage, cow } => {
            // Alias read-only or COW, the way replication does.
            let perm = if cow { PteFlags::USER_PRESENT | PteFlags::COW } else { PteFlags::USER_PRESENT };
            let (src, dst) = (pick(envs, src), pick(envs, dst));
            if kernel.sys_page_map(root, src, page_va(srcpage), dst, page_va(dstpage), perm).is_ok() {
                // Downgrade the source too so no private writable alias remains.
                let _ = kernel.sys_page_map(root, src, page_va(srcpage), src, page_va(srcpage), perm);
            }
        }
        Op::Unmap { env, page } => {
            let _ = kernel.sys_page_unmap(root, pick(envs, env), page_va(page));
        }
        Op::Exofork => {
            if let Ok(child) = kernel.sys_exofork(root) {
                envs.push(child);
            }
        }
        Op::Destroy { env } => {
            if envs.len() > 1 {
                let victim = envs.remove(1 + env % (envs.len() - 1));
                let _ = kernel.sys_env_destroy(root, victim);
            }
        }
    }
}

fn boot() -> (Kernel, EnvId) {
    let mut kernel = Kernel::new(KernelConfig::new().with_phys_frames(48).with_max_envs(8));
    let root = kernel.create_env(0x0080_0000).unwrap();
    kernel.sched_yield();
    (kernel, root)
}

proptest! {
    #[test]
    fn random_sequences_keep_invariants(ops in prop::collection::vec(arb_op(), 1..64)) {
        let (mut kernel, root) = boot();
        let mut envs = alloc::vec![root];
        for op in &ops {
            apply(&mut kernel, root, &mut envs, op);
            let violations = check_all(&kernel);
            prop_assert!(violations.is_empty(), "after {:?}: {:?}", op, violations);
        }
    }

    #[test]
    fn destroy_everything_returns_every_frame(ops in prop::collection::vec(arb_op(), 1..48)) {
        let (mut kernel, root) = boot();
        let free_before = kernel.frames().free_frames();
        let mut envs = alloc::vec![root];
        for op in &ops {
            apply(&mut kernel, root, &mut envs, op);
        }
        for child in envs.drain(1..) {
            kernel.sys_env_destroy(root, child).unwrap();
        }
        // Only the frames the root still references may remain in use.
        let mut held = BTreeSet::new();
        if let Some(pgdir) = kernel.envs.find(root).and_then(|env| env.pgdir.as_ref()) {
            held.insert(pgdir.root());
            held.extend(pgdir.table_frames());
            held.extend(pgdir.mappings().map(|(_, pte)| pte.frame()));
        }
        // Booting took the directory, the stack table and the stack page.
        prop_assert_eq!(kernel.frames().free_frames() + held.len(), free_before + 3);
    }
}
