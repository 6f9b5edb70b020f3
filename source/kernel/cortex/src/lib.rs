// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

//! CONTEXT: Cortex kernel model: address spaces, rendezvous IPC and fault upcalls
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelLock, KernelConfig, UserContext, check_all
//! DEPENDS_ON: cortex_abi, log, spin, bitflags, static_assertions
//! INVARIANTS: One CPU; every syscall runs to completion under KernelLock;
//!             frame refcounts track live references exactly (see invariants)

extern crate alloc;

mod aspace;
pub mod config;
mod context;
pub mod env;
pub mod invariants;
mod ipc;
mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;

pub use config::KernelConfig;
pub use context::UserContext;
pub use invariants::{check_all, InvariantViolation};
pub use kernel::{Kernel, KernelLock};
