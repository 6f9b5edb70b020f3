// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Registry giving upcall entry functions a user code address.

extern crate alloc;

use alloc::vec::Vec;
use cortex_abi::layout::UTEXT;
use cortex_abi::{UpcallAddr, UpcallEntry};

/// Base of the synthetic text range handed out to upcall entries.
const UPCALL_TEXT_BASE: u32 = UTEXT + 0x000f_0000;
const UPCALL_STRIDE: u32 = 0x10;

#[derive(Default)]
pub struct UpcallTable {
    entries: Vec<UpcallEntry>,
}

impl UpcallTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Returns the address of `entry`, registering it on first use.
    pub fn register(&mut self, entry: UpcallEntry) -> UpcallAddr {
        let index = match self
            .entries
            .iter()
            .position(|known| *known as usize == entry as usize)
        {
            Some(index) => index,
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        UpcallAddr(UPCALL_TEXT_BASE + index as u32 * UPCALL_STRIDE)
    }

    pub fn resolve(&self, addr: UpcallAddr) -> Option<UpcallEntry> {
        let offset = addr.0.checked_sub(UPCALL_TEXT_BASE)?;
        if offset % UPCALL_STRIDE != 0 {
            return None;
        }
        self.entries.get((offset / UPCALL_STRIDE) as usize).copied()
    }
}
