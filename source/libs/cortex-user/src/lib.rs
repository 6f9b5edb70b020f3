// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: User runtime built only from cortex syscalls and fault upcalls
//! OWNERS: @runtime
//! PUBLIC API: fork(), sfork(), fork_with(policy), child_entry(), set_pgfault_handler(),
//!             cow::pgfault, ipc::{send, recv}
//! DEPENDS_ON: cortex_abi::{Syscalls, UserMemory}
//! INVARIANTS: Never maps an exception stack shared or COW; never creates a second private
//!             writable alias of a frame; a failed fork leaves the child NotRunnable

pub mod cow;
mod error;
pub mod fork;
pub mod ipc;
mod pgfault;
#[cfg(test)]
mod tests_prop;

pub use error::ForkError;
pub use fork::{child_entry, fork, fork_with, sfork, ForkPolicy};
pub use pgfault::{set_pgfault_handler, UXSTACK_PAGE};
