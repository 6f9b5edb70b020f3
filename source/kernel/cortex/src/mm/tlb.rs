// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Direct-mapped software TLB.
//!
//! Translations are cached per address space (the environment slot). Any PTE
//! change must invalidate the cached entry, otherwise a stale permission would
//! outlive a remap.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use cortex_abi::{Pte, VirtAddr};

/// Address-space identifier: the environment slot.
pub type Asid = usize;

#[derive(Clone, Copy, Debug)]
struct Entry {
    asid: Asid,
    vpn: u32,
    pte: Pte,
}

pub struct Tlb {
    entries: Vec<Option<Entry>>,
    hits: u64,
    misses: u64,
}

impl Tlb {
    /// `size` must be a power of two.
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self { entries: vec![None; size], hits: 0, misses: 0 }
    }

    fn index(&self, asid: Asid, vpn: u32) -> usize {
        (vpn as usize ^ asid.wrapping_mul(0x9e37)) & (self.entries.len() - 1)
    }

    pub fn lookup(&mut self, asid: Asid, va: VirtAddr) -> Option<Pte> {
        let vpn = va.page_number();
        let idx = self.index(asid, vpn);
        match self.entries[idx] {
            Some(entry) if entry.asid == asid && entry.vpn == vpn => {
                self.hits += 1;
                Some(entry.pte)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn fill(&mut self, asid: Asid, va: VirtAddr, pte: Pte) {
        let vpn = va.page_number();
        let idx = self.index(asid, vpn);
        self.entries[idx] = Some(Entry { asid, vpn, pte });
    }

    pub fn invalidate(&mut self, asid: Asid, va: VirtAddr) {
        let vpn = va.page_number();
        let idx = self.index(asid, vpn);
        if matches!(self.entries[idx], Some(entry) if entry.asid == asid && entry.vpn == vpn) {
            self.entries[idx] = None;
        }
    }

    /// Drops every translation of `asid`.
    pub fn flush(&mut self, asid: Asid) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(entry) if entry.asid == asid) {
                *slot = None;
            }
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
