// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Host harness for driving cortex environments from integration tests.

use cortex::{Kernel, KernelConfig, UserContext};
use cortex_abi::{EnvId, MemoryFault, UserMemory, VirtAddr};

/// Entry point given to root environments; never executed by the host model.
pub const ROOT_ENTRY: u32 = 0x0080_0020;

/// Boots a kernel with `frames` physical frames and one root environment.
pub fn boot(frames: usize) -> (Kernel, EnvId) {
    let mut kernel = Kernel::new(
        KernelConfig::new().with_phys_frames(frames).with_max_envs(16),
    );
    let root = kernel.create_env(ROOT_ENTRY).expect("root env");
    (kernel, root)
}

/// Switches to `env` and runs `f` as that environment.
pub fn run<R>(kernel: &mut Kernel, env: EnvId, f: impl FnOnce(&mut UserContext<'_>) -> R) -> R {
    let mut ctx = kernel.enter(env).expect("env is runnable");
    f(&mut ctx)
}

/// Reads one byte as `env`, faulting it in if needed.
pub fn read_byte(kernel: &mut Kernel, env: EnvId, va: u32) -> Result<u8, MemoryFault> {
    run(kernel, env, |ctx| {
        let mut byte = [0u8; 1];
        ctx.load(VirtAddr::new(va), &mut byte)?;
        Ok(byte[0])
    })
}

/// Writes one byte as `env`, faulting it in if needed.
pub fn write_byte(kernel: &mut Kernel, env: EnvId, va: u32, value: u8) -> Result<(), MemoryFault> {
    run(kernel, env, |ctx| ctx.store(VirtAddr::new(va), &[value]))
}

/// Panics with the violations if any address-space invariant is broken.
pub fn assert_consistent(kernel: &Kernel) {
    let violations = cortex::check_all(kernel);
    assert!(violations.is_empty(), "invariant violations: {violations:#?}");
}
