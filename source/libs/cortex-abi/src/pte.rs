// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table entry encoding shared by the kernel and the read-only page-table view.

use bitflags::bitflags;
use core::fmt;

use crate::layout::PAGE_SHIFT;

bitflags! {
    /// Permission and status bits of a PTE.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct PteFlags: u32 {
        /// Mapping is valid.
        const PRESENT = 1 << 0;
        /// Hardware-writable.
        const WRITABLE = 1 << 1;
        /// Reachable from user mode.
        const USER = 1 << 2;
        /// Set by the MMU when the entry is loaded.
        const ACCESSED = 1 << 5;
        /// Set by the MMU on the first write.
        const DIRTY = 1 << 6;
        /// Bits reserved for software.
        const AVAIL = 0xe00;
        /// Software: page is shared with children as-is, never copy-on-write.
        const SHARE = 0x400;
        /// Software: page is copy-on-write.
        const COW = 0x800;
        /// Bits a user environment may pass to a mapping syscall.
        const SYSCALL = Self::AVAIL.bits() | Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();
    }
}

impl PteFlags {
    /// Minimum bits every user mapping carries.
    pub const USER_PRESENT: Self = Self::PRESENT.union(Self::USER);
    /// Private writable user page.
    pub const USER_RW: Self = Self::USER_PRESENT.union(Self::WRITABLE);

    /// Checks `self` as a permission argument to a mapping syscall.
    ///
    /// Requires `PRESENT|USER`, nothing outside [`PteFlags::SYSCALL`], and never
    /// `COW` together with `WRITABLE`.
    pub const fn is_valid_user_perm(self) -> bool {
        self.contains(Self::USER_PRESENT)
            && Self::SYSCALL.contains(self)
            && !self.contains(Self::COW.union(Self::WRITABLE))
    }
}

/// Physical frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct FrameNumber(u32);

impl FrameNumber {
    /// Wraps a raw frame number.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw frame number.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Index into a frame array.
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// A raw page-table entry: frame number in bits 12..32, flags in bits 0..12.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    /// The empty entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry from a frame and flags.
    pub const fn new(frame: FrameNumber, flags: PteFlags) -> Self {
        Self((frame.as_raw() << PAGE_SHIFT) | (flags.bits() & 0xfff))
    }

    /// Reinterprets a raw entry.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw entry.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Frame the entry points at.
    pub const fn frame(self) -> FrameNumber {
        FrameNumber::from_raw(self.0 >> PAGE_SHIFT)
    }

    /// Flag bits of the entry.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & 0xfff)
    }

    /// Whether `PRESENT` is set.
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Returns a copy with `flags` added.
    pub const fn with(self, flags: PteFlags) -> Self {
        Self(self.0 | (flags.bits() & 0xfff))
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pte")
            .field("frame", &self.frame().as_raw())
            .field("flags", &self.flags())
            .finish()
    }
}
