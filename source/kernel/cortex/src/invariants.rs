// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Runtime checks of the address-space invariants
//! OWNERS: @kernel-mm-team
//! PUBLIC API: check_all(&Kernel), InvariantViolation
//! DEPENDS_ON: mm::FramePool, env::EnvTable
//! INVARIANTS: Read-only; may be called between any two syscalls

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use cortex_abi::{EnvId, FrameNumber, PteFlags, VirtAddr};

use crate::kernel::Kernel;

/// One broken invariant, with enough context to debug it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub description: String,
}

impl InvariantViolation {
    fn new(invariant: &'static str, description: String) -> Self {
        Self { invariant, description }
    }
}

#[derive(Default)]
struct FrameUse {
    references: usize,
    writers: Vec<(EnvId, VirtAddr)>,
}

/// Checks refcounts, the free list and writable aliasing across every environment.
pub fn check_all(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut uses: BTreeMap<FrameNumber, FrameUse> = BTreeMap::new();

    for env in kernel.envs.iter() {
        let Some(pgdir) = env.pgdir.as_ref() else {
            continue;
        };
        uses.entry(pgdir.root()).or_default().references += 1;
        for table in pgdir.table_frames() {
            uses.entry(table).or_default().references += 1;
        }
        for (va, pte) in pgdir.mappings() {
            let flags = pte.flags();
            let entry = uses.entry(pte.frame()).or_default();
            entry.references += 1;
            if flags.contains(PteFlags::COW | PteFlags::WRITABLE) {
                violations.push(InvariantViolation::new(
                    "cow-never-writable",
                    format!("{} maps {:?} COW and writable", env.id, va),
                ));
            }
            if flags.contains(PteFlags::WRITABLE) && !flags.intersects(PteFlags::COW | PteFlags::SHARE) {
                entry.writers.push((env.id, va));
            }
        }
    }

    for frame in kernel.frames.frames() {
        let refcount = kernel.frames.refcount(frame) as usize;
        let free = kernel.frames.is_free(frame);
        let expected = uses.get(&frame).map_or(0, |usage| usage.references);
        if refcount != expected {
            violations.push(InvariantViolation::new(
                "frame-refcount",
                format!("frame {} refcount {} but {} references", frame.as_raw(), refcount, expected),
            ));
        }
        if free != (refcount == 0) {
            violations.push(InvariantViolation::new(
                "free-list",
                format!("frame {} free={} with refcount {}", frame.as_raw(), free, refcount),
            ));
        }
    }

    for (frame, usage) in &uses {
        if usage.writers.len() > 1 {
            violations.push(InvariantViolation::new(
                "no-dual-writable",
                format!("frame {} writable through {:?}", frame.as_raw(), usage.writers),
            ));
        }
    }

    if !violations.is_empty() {
        log::warn!(target: "mm", "{} invariant violation(s)", violations.len());
    }
    violations
}
