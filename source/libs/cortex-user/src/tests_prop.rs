// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for copy-on-write replication
//! OWNERS: @runtime
//! NOTE: Tests only; no runtime logic. Drives fork and user writes on the host kernel model.
//!
//! TEST_SCOPE:
//!   - After any Fork/Write sequence every environment reads exactly what it wrote or inherited
//!   - Replication never leaves two private writable aliases of a frame
//!   - sfork parents and children observe each other's writes to data pages
//!
//! TEST_SCENARIOS:
//!   - cow_fork_isolates_writes(): random forks and writes checked against a per-environment model
//!   - sfork_shares_data_pages(): random writes from either side of one sfork

use cortex::{check_all, Kernel, KernelConfig};
use cortex_abi::layout::PAGE_SIZE;
use cortex_abi::{EnvId, PteFlags, Syscalls, UserMemory, VirtAddr};
use proptest::prelude::*;

use crate::{fork, sfork};

const PAGES: usize = 4;
const MAX_ENVS: usize = 6;

#[derive(Clone, Debug)]
enum Op {
    Write { env: usize, page: usize, value: u8 },
    Fork { env: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..MAX_ENVS, 0usize..PAGES, any::<u8>())
            .prop_map(|(env, page, value)| Op::Write { env, page, value }),
        1 => (0usize..MAX_ENVS).prop_map(|env| Op::Fork { env }),
    ]
}

fn page_va(page: usize) -> VirtAddr {
    VirtAddr::new(0x1000 + (page * PAGE_SIZE) as u32)
}

fn boot() -> (Kernel, EnvId) {
    let mut kernel = Kernel::new(KernelConfig::new().with_phys_frames(512).with_max_envs(8));
    let root = kernel.create_env(0x0080_0000).unwrap();
    let mut ctx = kernel.enter(root).unwrap();
    for page in 0..PAGES {
        ctx.page_alloc(EnvId::SELF, page_va(page), PteFlags::USER_RW).unwrap();
    }
    drop(ctx);
    (kernel, root)
}

fn write(kernel: &mut Kernel, env: EnvId, page: usize, value: u8) {
    let mut ctx = kernel.enter(env).unwrap();
    ctx.store(page_va(page), &[value]).unwrap();
}

fn read(kernel: &Kernel, env: EnvId, page: usize) -> u8 {
    let mut byte = [0u8];
    assert!(kernel.peek(env, page_va(page), &mut byte));
    byte[0]
}

proptest! {
    #[test]
    fn cow_fork_isolates_writes(ops in prop::collection::vec(arb_op(), 1..40)) {
        let (mut kernel, root) = boot();
        let mut envs = vec![(root, [0u8; PAGES])];
        for op in &ops {
            match *op {
                Op::Write { env, page, value } => {
                    let index = env % envs.len();
                    write(&mut kernel, envs[index].0, page, value);
                    envs[index].1[page] = value;
                }
                Op::Fork { env } => {
                    if envs.len() < MAX_ENVS {
                        let (parent, memory) = envs[env % envs.len()];
                        let child = fork(&mut kernel.enter(parent).unwrap()).unwrap();
                        envs.push((child, memory));
                    }
                }
            }
            let violations = check_all(&kernel);
            prop_assert!(violations.is_empty(), "after {:?}: {:?}", op, violations);
            for &(id, memory) in &envs {
                for (page, &expected) in memory.iter().enumerate() {
                    prop_assert_eq!(read(&kernel, id, page), expected, "env {} page {}", id, page);
                }
            }
        }
    }

    #[test]
    fn sfork_shares_data_pages(
        writes in prop::collection::vec((any::<bool>(), 0usize..PAGES, any::<u8>()), 1..24)
    ) {
        let (mut kernel, parent) = boot();
        let child = sfork(&mut kernel.enter(parent).unwrap()).unwrap();
        let mut memory = [0u8; PAGES];
        for &(from_child, page, value) in &writes {
            write(&mut kernel, if from_child { child } else { parent }, page, value);
            memory[page] = value;
            for (page, &expected) in memory.iter().enumerate() {
                prop_assert_eq!(read(&kernel, parent, page), expected);
                prop_assert_eq!(read(&kernel, child, page), expected);
            }
        }
        prop_assert!(check_all(&kernel).is_empty());
    }
}
