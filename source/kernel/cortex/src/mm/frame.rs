// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame pool with per-frame reference counts
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FramePool (alloc/free/incref/decref/refcount/bytes), AllocFlags, OutOfMemory
//! DEPENDS_ON: cortex_abi::FrameNumber
//! INVARIANTS: Frame 0 is never handed out; a frame is on the free list iff its refcount is 0
//!             and it is not held by a caller between alloc and first insert

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use cortex_abi::layout::PAGE_SIZE;
use cortex_abi::FrameNumber;

bitflags! {
    /// Allocation modifiers.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AllocFlags: u8 {
        /// Fill the frame with zeroes.
        const ZERO = 1 << 0;
    }
}

/// No free frame is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

type FrameData = Box<[u8; PAGE_SIZE]>;

struct PageInfo {
    refcount: u32,
    free: bool,
    data: Option<FrameData>,
}

/// Pool of physical frames.
///
/// A freshly allocated frame has refcount 0; the first PTE (or table slot)
/// that references it takes the first reference.
pub struct FramePool {
    pages: Vec<PageInfo>,
    free_list: Vec<FrameNumber>,
    #[cfg(feature = "failpoints")]
    deny_next_table: bool,
}

impl FramePool {
    /// Creates a pool of `count` usable frames numbered `1..=count`.
    pub fn new(count: usize) -> Self {
        let mut pages = Vec::with_capacity(count + 1);
        // Frame 0 stays reserved so that an all-zero PTE means "unmapped".
        pages.push(PageInfo { refcount: 1, free: false, data: None });
        for _ in 0..count {
            pages.push(PageInfo { refcount: 0, free: true, data: None });
        }
        // Pop order hands out low frames first.
        let free_list = (1..=count as u32).rev().map(FrameNumber::from_raw).collect();
        Self {
            pages,
            free_list,
            #[cfg(feature = "failpoints")]
            deny_next_table: false,
        }
    }

    /// Usable frames, free or not.
    pub fn capacity(&self) -> usize {
        self.pages.len() - 1
    }

    pub fn free_frames(&self) -> usize {
        self.free_list.len()
    }

    /// Takes a frame off the free list.
    pub fn alloc(&mut self, flags: AllocFlags) -> Result<FrameNumber, OutOfMemory> {
        let frame = self.free_list.pop().ok_or(OutOfMemory)?;
        let page = &mut self.pages[frame.as_index()];
        page.free = false;
        if flags.contains(AllocFlags::ZERO) {
            match page.data.as_mut() {
                Some(data) => data.fill(0),
                None => page.data = Some(Box::new([0u8; PAGE_SIZE])),
            }
        }
        log::trace!(target: "mm", "frame alloc {} (free={})", frame.as_raw(), self.free_list.len());
        Ok(frame)
    }

    /// Allocates a zeroed frame for page-table use.
    pub fn alloc_table(&mut self) -> Result<FrameNumber, OutOfMemory> {
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.deny_next_table) {
            log::warn!(target: "mm", "failpoint: denying page-table allocation");
            return Err(OutOfMemory);
        }
        self.alloc(AllocFlags::ZERO)
    }

    /// Makes the next [`alloc_table`](Self::alloc_table) fail.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_table_alloc(&mut self) {
        self.deny_next_table = true;
    }

    /// Returns an unreferenced frame to the pool.
    pub fn free(&mut self, frame: FrameNumber) {
        let Some(page) = self.pages.get_mut(frame.as_index()) else {
            log::error!(target: "mm", "free of unknown frame {}", frame.as_raw());
            return;
        };
        if page.refcount != 0 || page.free || frame.as_raw() == 0 {
            log::error!(
                target: "mm",
                "refusing to free frame {} (refcount={}, free={})",
                frame.as_raw(),
                page.refcount,
                page.free
            );
            return;
        }
        page.free = true;
        self.free_list.push(frame);
    }

    /// Takes one more reference; fails once the count is exhausted.
    pub fn incref(&mut self, frame: FrameNumber) -> Result<(), OutOfMemory> {
        let Some(page) = self.pages.get_mut(frame.as_index()) else {
            return Ok(());
        };
        page.refcount = page.refcount.checked_add(1).ok_or(OutOfMemory)?;
        Ok(())
    }

    /// Whether `frame` can take another reference.
    pub fn can_incref(&self, frame: FrameNumber) -> bool {
        self.refcount(frame) < u32::MAX
    }

    #[cfg(test)]
    pub(crate) fn set_refcount(&mut self, frame: FrameNumber, refcount: u32) {
        self.pages[frame.as_index()].refcount = refcount;
    }

    /// Drops one reference; frees the frame when the last one goes. Returns whether it was freed.
    pub fn decref(&mut self, frame: FrameNumber) -> bool {
        let Some(page) = self.pages.get_mut(frame.as_index()) else {
            return false;
        };
        if page.refcount == 0 {
            log::error!(target: "mm", "decref underflow on frame {}", frame.as_raw());
            return false;
        }
        page.refcount -= 1;
        if page.refcount == 0 {
            self.free(frame);
            return true;
        }
        false
    }

    pub fn refcount(&self, frame: FrameNumber) -> u32 {
        self.pages.get(frame.as_index()).map_or(0, |page| page.refcount)
    }

    pub fn is_free(&self, frame: FrameNumber) -> bool {
        self.pages.get(frame.as_index()).is_some_and(|page| page.free)
    }

    /// Contents of `frame`; unwritten frames read as zero.
    pub fn bytes(&self, frame: FrameNumber) -> &[u8; PAGE_SIZE] {
        const ZERO: [u8; PAGE_SIZE] = [0u8; PAGE_SIZE];
        match self.pages.get(frame.as_index()).and_then(|page| page.data.as_deref()) {
            Some(data) => data,
            None => &ZERO,
        }
    }

    /// Mutable contents of `frame`, materialising storage on first use.
    pub fn bytes_mut(&mut self, frame: FrameNumber) -> Option<&mut [u8; PAGE_SIZE]> {
        let page = self.pages.get_mut(frame.as_index())?;
        if frame.as_raw() == 0 {
            return None;
        }
        Some(page.data.get_or_insert_with(|| Box::new([0u8; PAGE_SIZE])))
    }

    /// Iterates over every usable frame.
    pub fn frames(&self) -> impl Iterator<Item = FrameNumber> + '_ {
        (1..self.pages.len() as u32).map(FrameNumber::from_raw)
    }
}
