// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory for the two-level user address space.

pub mod frame;
pub mod page_table;
pub mod tlb;

#[cfg(test)]
mod tests_prop;

pub use frame::{AllocFlags, FramePool, OutOfMemory};
pub use page_table::{MapError, PageDirectory};
pub use tlb::{Asid, Tlb};

use cortex_abi::{FaultCode, FrameNumber, PteFlags, VirtAddr};

/// Kind of user access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Translates a user access through the TLB, walking the directory on a miss.
///
/// Sets `ACCESSED` when a translation is loaded and `DIRTY` on the first write,
/// like the MMU would. Returns the fault code the hardware would raise on failure.
pub fn translate(
    dir: &mut PageDirectory,
    tlb: &mut Tlb,
    asid: Asid,
    va: VirtAddr,
    access: Access,
) -> Result<FrameNumber, FaultCode> {
    let page = va.round_down();
    let mut code = FaultCode::USER;
    if access == Access::Write {
        code |= FaultCode::WRITE;
    }

    let pte = match tlb.lookup(asid, page) {
        Some(pte) => pte,
        None => {
            let pte = dir.mark(page, PteFlags::ACCESSED).ok_or(code)?;
            tlb.fill(asid, page, pte);
            pte
        }
    };

    let flags = pte.flags();
    if !flags.contains(PteFlags::USER) {
        return Err(code | FaultCode::PRESENT);
    }
    if access == Access::Write {
        if !flags.contains(PteFlags::WRITABLE) {
            return Err(code | FaultCode::PRESENT);
        }
        if !flags.contains(PteFlags::DIRTY) {
            if let Some(updated) = dir.mark(page, PteFlags::DIRTY) {
                tlb.fill(asid, page, updated);
            }
        }
    }
    Ok(pte.frame())
}
