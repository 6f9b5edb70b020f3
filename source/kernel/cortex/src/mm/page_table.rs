// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page directory backed by the frame pool.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use cortex_abi::layout::PT_ENTRIES;
use cortex_abi::{FrameNumber, Pte, PteFlags, VirtAddr};

use super::frame::{FramePool, OutOfMemory};
use super::tlb::{Asid, Tlb};

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A page table could not be allocated.
    OutOfMemory,
    /// Virtual address is not page aligned.
    Unaligned,
    /// Address is outside the user range.
    OutOfRange,
}

impl From<OutOfMemory> for MapError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

struct PageTable {
    frame: FrameNumber,
    entries: Box<[Pte; PT_ENTRIES]>,
}

/// Per-environment page directory.
///
/// The root and each second-level table own one pool frame (refcount 1).
/// Second-level tables are created on demand and kept until [`release`](Self::release).
pub struct PageDirectory {
    root: FrameNumber,
    tables: BTreeMap<usize, PageTable>,
}

impl PageDirectory {
    /// Allocates the root frame.
    pub fn new(frames: &mut FramePool) -> Result<Self, MapError> {
        let root = frames.alloc_table()?;
        frames.incref(root)?;
        Ok(Self { root, tables: BTreeMap::new() })
    }

    pub fn root(&self) -> FrameNumber {
        self.root
    }

    /// Frames backing the second-level tables.
    pub fn table_frames(&self) -> impl Iterator<Item = FrameNumber> + '_ {
        self.tables.values().map(|table| table.frame)
    }

    pub fn table_present(&self, va: VirtAddr) -> bool {
        self.tables.contains_key(&va.dir_index())
    }

    /// Raw entry for `va`, `None` when no table covers it.
    pub fn entry(&self, va: VirtAddr) -> Option<Pte> {
        self.tables
            .get(&va.dir_index())
            .map(|table| table.entries[va.table_index()])
    }

    /// Present entry for `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        self.entry(va).filter(|pte| pte.is_present())
    }

    fn walk_create(&mut self, va: VirtAddr, frames: &mut FramePool) -> Result<&mut Pte, MapError> {
        let dir = va.dir_index();
        if !self.tables.contains_key(&dir) {
            let frame = frames.alloc_table()?;
            frames.incref(frame)?;
            log::trace!(target: "mm", "page table for dir {} in frame {}", dir, frame.as_raw());
            self.tables.insert(dir, PageTable { frame, entries: Box::new([Pte::EMPTY; PT_ENTRIES]) });
        }
        let table = self.tables.get_mut(&dir).ok_or(MapError::OutOfMemory)?;
        Ok(&mut table.entries[va.table_index()])
    }

    /// Maps `frame` at `va`, replacing any previous mapping.
    ///
    /// The new reference is taken before the old one is dropped, so re-inserting
    /// the frame already mapped at `va` never frees it. A frame whose reference
    /// count is exhausted is refused as `OutOfMemory`. On error nothing changes.
    pub fn insert(
        &mut self,
        frames: &mut FramePool,
        tlb: &mut Tlb,
        asid: Asid,
        frame: FrameNumber,
        va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), MapError> {
        if !va.is_aligned() {
            return Err(MapError::Unaligned);
        }
        if !va.is_user() {
            return Err(MapError::OutOfRange);
        }
        if !frames.can_incref(frame) {
            log::warn!(target: "mm", "frame {} reference count exhausted", frame.as_raw());
            return Err(MapError::OutOfMemory);
        }
        let slot = self.walk_create(va, frames)?;
        frames.incref(frame)?;
        let old = core::mem::replace(slot, Pte::new(frame, perm | PteFlags::PRESENT));
        if old.is_present() {
            frames.decref(old.frame());
        }
        tlb.invalidate(asid, va);
        Ok(())
    }

    /// Unmaps `va`; returns the frame that was mapped there.
    pub fn remove(
        &mut self,
        frames: &mut FramePool,
        tlb: &mut Tlb,
        asid: Asid,
        va: VirtAddr,
    ) -> Option<FrameNumber> {
        let table = self.tables.get_mut(&va.dir_index())?;
        let slot = &mut table.entries[va.table_index()];
        if !slot.is_present() {
            return None;
        }
        let old = core::mem::replace(slot, Pte::EMPTY);
        frames.decref(old.frame());
        tlb.invalidate(asid, va);
        Some(old.frame())
    }

    /// ORs `flags` into the present entry for `va` (accessed/dirty tracking).
    pub fn mark(&mut self, va: VirtAddr, flags: PteFlags) -> Option<Pte> {
        let table = self.tables.get_mut(&va.dir_index())?;
        let slot = &mut table.entries[va.table_index()];
        if !slot.is_present() {
            return None;
        }
        *slot = slot.with(flags);
        Some(*slot)
    }

    /// Every present mapping, in address order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, Pte)> + '_ {
        self.tables.iter().flat_map(|(&dir, table)| {
            table
                .entries
                .iter()
                .enumerate()
                .filter(|(_, pte)| pte.is_present())
                .map(move |(idx, pte)| (VirtAddr::from_indices(dir, idx), *pte))
        })
    }

    /// Drops every mapping, every table and finally the root.
    pub fn release(self, frames: &mut FramePool, tlb: &mut Tlb, asid: Asid) {
        let mut released = 0usize;
        for table in self.tables.values() {
            for pte in table.entries.iter().filter(|pte| pte.is_present()) {
                frames.decref(pte.frame());
                released += 1;
            }
            frames.decref(table.frame);
        }
        frames.decref(self.root);
        tlb.flush(asid);
        log::debug!(
            target: "mm",
            "released {} mappings and {} tables (asid {})",
            released,
            self.tables.len(),
            asid
        );
    }
}
