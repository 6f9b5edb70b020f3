// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User address-space layout for the two-level 32-bit paging model.
//!
//! ```text
//!   UTOP, UXSTACKTOP -> +------------------------+ 0xeec0_0000
//!                       |   exception stack      |  PAGE_SIZE
//!                       +------------------------+ 0xeebf_f000
//!                       |   empty guard page     |
//!         USTACKTOP  -> +------------------------+ 0xeebf_e000
//!                       |   normal user stack    |
//!                       +------------------------+
//!                       |          ...           |
//!             UTEXT  -> +------------------------+ 0x0080_0000
//!            PFTEMP  -> |   scratch page         | 0x007f_f000
//!             UTEMP  -> +------------------------+ 0x0040_0000
//! ```

use core::fmt;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;
/// Entries per page directory and per page table.
pub const PT_ENTRIES: usize = 1024;
/// Bytes of address space covered by one page table.
pub const PT_SPAN: u32 = (PAGE_SIZE * PT_ENTRIES) as u32;
/// Shift selecting the page-directory index.
pub const PDX_SHIFT: u32 = 22;

/// First address above the user-controlled part of the address space.
pub const UTOP: u32 = 0xeec0_0000;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack; one guard page separates it from the exception stack.
pub const USTACKTOP: u32 = UTOP - 2 * PAGE_SIZE as u32;
/// Where user programs are linked.
pub const UTEXT: u32 = 2 * PT_SPAN;
/// Temporary mapping window used by the runtime.
pub const UTEMP: u32 = PT_SPAN;
/// Scratch page used for COW repair and exception-stack copying.
pub const PFTEMP: u32 = UTEMP + PT_SPAN - PAGE_SIZE as u32;

/// A user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Wraps a raw address.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the address if it is page aligned.
    pub const fn page_aligned(raw: u32) -> Option<Self> {
        if raw % PAGE_SIZE as u32 == 0 {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Returns the raw address.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether the address is page aligned.
    pub const fn is_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u32 == 0
    }

    /// Whether the address lies below [`UTOP`].
    pub const fn is_user(self) -> bool {
        self.0 < UTOP
    }

    /// Rounds down to the containing page.
    pub const fn round_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    /// Offset within the containing page.
    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u32 - 1)) as usize
    }

    /// Virtual page number.
    pub const fn page_number(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Page-directory index.
    pub const fn dir_index(self) -> usize {
        (self.0 >> PDX_SHIFT) as usize
    }

    /// Page-table index.
    pub const fn table_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) as usize) & (PT_ENTRIES - 1)
    }

    /// Builds the address of page `table` of directory slot `dir`.
    pub const fn from_indices(dir: usize, table: usize) -> Self {
        Self(((dir as u32) << PDX_SHIFT) | ((table as u32) << PAGE_SHIFT))
    }

    /// Adds `bytes`, returning `None` on overflow.
    pub const fn checked_add(self, bytes: u32) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

static_assertions::const_assert_eq!(UXSTACKTOP % PAGE_SIZE as u32, 0);
static_assertions::const_assert!(PFTEMP < UTEXT);
