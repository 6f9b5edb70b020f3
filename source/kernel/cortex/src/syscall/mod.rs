// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Register-level syscall dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Handler
//! DEPENDS_ON: context::UserContext, syscall::api
//! INVARIANTS: Stable IDs from cortex_abi::SyscallNumber; decode/check/execute discipline;
//!             unknown numbers fail with InvalidArgument

pub mod api;

pub use cortex_abi::SysResult;
use cortex_abi::SyscallNumber;

use crate::context::UserContext;

/// Syscall arguments passed in `edx, ecx, ebx, edi, esi`.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [u32; 5],
}

impl Args {
    pub const fn new(regs: [u32; 5]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> u32 {
        self.regs[index]
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut UserContext<'_>, &Args) -> SysResult<u32>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; SyscallNumber::COUNT],
}

impl SyscallTable {
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; SyscallNumber::COUNT] }
    }

    pub fn register(&mut self, number: SyscallNumber, handler: Handler) {
        self.handlers[number as usize] = Some(handler);
    }

    /// Handler registered for the raw number in `eax`.
    pub fn handler(&self, number: u32) -> Option<Handler> {
        self.handlers.get(number as usize).copied().flatten()
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
