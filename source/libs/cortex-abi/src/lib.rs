// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI between the cortex kernel model and its user runtime
//! OWNERS: @runtime
//! PUBLIC API: EnvId, EnvStatus, EnvInfo, VirtAddr, Pte, PteFlags, UTrapframe, SysError, Syscalls, UserMemory
//! DEPENDS_ON: bitflags, thiserror (no_std), static_assertions
//! INVARIANTS: UTrapframe is 52 bytes LE; syscall numbers and error codes are stable;
//!             a user permission never combines COW with WRITABLE

pub mod env;
pub mod error;
pub mod layout;
pub mod pte;
pub mod syscall;
pub mod trapframe;

pub use env::{EnvId, EnvInfo, EnvStatus};
pub use error::{MemoryFault, SysError, SysResult, UserPanic};
pub use layout::VirtAddr;
pub use pte::{FrameNumber, Pte, PteFlags};
pub use syscall::{SyscallNumber, Syscalls, UpcallAddr, UpcallEntry, UserEnv, UserMemory};
pub use trapframe::{FaultCode, PushRegs, Trapframe, UTrapframe};
