// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time sizing of the kernel model.

use cortex_abi::env::NENV;

/// Sizing knobs fixed when the kernel is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Environment slots; clamped to `NENV`.
    pub max_envs: usize,
    /// Physical frames handed to the frame pool.
    pub phys_frames: usize,
    /// Entries in the software TLB.
    pub tlb_entries: usize,
    /// Faults one user access may take before the environment is killed.
    pub fault_retry_limit: u32,
}

impl KernelConfig {
    pub const DEFAULT_MAX_ENVS: usize = 64;
    pub const DEFAULT_PHYS_FRAMES: usize = 1024;
    pub const DEFAULT_TLB_ENTRIES: usize = 64;
    pub const DEFAULT_FAULT_RETRY_LIMIT: u32 = 4;

    pub const fn new() -> Self {
        Self {
            max_envs: Self::DEFAULT_MAX_ENVS,
            phys_frames: Self::DEFAULT_PHYS_FRAMES,
            tlb_entries: Self::DEFAULT_TLB_ENTRIES,
            fault_retry_limit: Self::DEFAULT_FAULT_RETRY_LIMIT,
        }
    }

    pub const fn with_max_envs(mut self, max_envs: usize) -> Self {
        self.max_envs = max_envs;
        self
    }

    pub const fn with_phys_frames(mut self, phys_frames: usize) -> Self {
        self.phys_frames = phys_frames;
        self
    }

    pub const fn with_tlb_entries(mut self, tlb_entries: usize) -> Self {
        self.tlb_entries = tlb_entries;
        self
    }

    pub const fn with_fault_retry_limit(mut self, limit: u32) -> Self {
        self.fault_retry_limit = limit;
        self
    }

    /// Returns the configuration with every knob inside its legal range.
    pub fn normalized(self) -> Self {
        Self {
            max_envs: self.max_envs.clamp(1, NENV),
            phys_frames: self.phys_frames.max(1),
            tlb_entries: self.tlb_entries.max(1).next_power_of_two(),
            fault_retry_limit: self.fault_retry_limit.max(1),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
