// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Saved register state and the user fault record.

use bitflags::bitflags;

use crate::layout::VirtAddr;

/// Code segment selector for user mode (privilege level 3).
pub const GD_UT: u16 = 0x18 | 3;
/// Data/stack segment selector for user mode (privilege level 3).
pub const GD_UD: u16 = 0x20 | 3;
/// Interrupt-enable flag in `eflags`.
pub const FL_IF: u32 = 0x200;

bitflags! {
    /// Hardware page-fault error code.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct FaultCode: u32 {
        /// Fault on a present page (protection violation); clear means not-present.
        const PRESENT = 1 << 0;
        /// Faulting access was a write.
        const WRITE = 1 << 1;
        /// Fault taken in user mode.
        const USER = 1 << 2;
    }
}

/// General purpose registers in `pusha` order.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PushRegs {
    /// `edi`
    pub edi: u32,
    /// `esi`
    pub esi: u32,
    /// `ebp`
    pub ebp: u32,
    /// Ignored slot.
    pub oesp: u32,
    /// `ebx`
    pub ebx: u32,
    /// `edx`
    pub edx: u32,
    /// `ecx`
    pub ecx: u32,
    /// `eax`, the syscall return register.
    pub eax: u32,
}

impl PushRegs {
    const WORDS: usize = 8;

    fn to_words(self) -> [u32; Self::WORDS] {
        [
            self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax,
        ]
    }

    fn from_words(w: [u32; Self::WORDS]) -> Self {
        Self {
            edi: w[0],
            esi: w[1],
            ebp: w[2],
            oesp: w[3],
            ebx: w[4],
            edx: w[5],
            ecx: w[6],
            eax: w[7],
        }
    }
}

/// Register state saved on kernel entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Trapframe {
    /// General purpose registers.
    pub regs: PushRegs,
    /// Trap number of the last entry.
    pub trapno: u32,
    /// Error code of the last entry.
    pub err: u32,
    /// Resume instruction pointer.
    pub eip: u32,
    /// Code segment.
    pub cs: u16,
    /// Flags.
    pub eflags: u32,
    /// Resume stack pointer.
    pub esp: u32,
    /// Stack segment.
    pub ss: u16,
}

impl Trapframe {
    /// Fresh user-mode frame starting at `eip` with stack `esp`.
    pub const fn user(eip: u32, esp: u32) -> Self {
        Self {
            regs: PushRegs {
                edi: 0,
                esi: 0,
                ebp: 0,
                oesp: 0,
                ebx: 0,
                edx: 0,
                ecx: 0,
                eax: 0,
            },
            trapno: 0,
            err: 0,
            eip,
            cs: GD_UT,
            eflags: FL_IF,
            esp,
            ss: GD_UD,
        }
    }
}

/// Encoded size of [`Trapframe`]: fifteen little-endian words.
pub const TRAPFRAME_SIZE: usize = 15 * 4;

impl Trapframe {
    /// Serialises the frame; segment selectors are widened to a word.
    pub fn to_le_bytes(&self) -> [u8; TRAPFRAME_SIZE] {
        let mut words = [0u32; 15];
        words[..8].copy_from_slice(&self.regs.to_words());
        words[8] = self.trapno;
        words[9] = self.err;
        words[10] = self.eip;
        words[11] = u32::from(self.cs);
        words[12] = self.eflags;
        words[13] = self.esp;
        words[14] = u32::from(self.ss);
        let mut bytes = [0u8; TRAPFRAME_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Deserialises a frame; selector words are truncated to 16 bits.
    pub fn from_le_bytes(bytes: &[u8; TRAPFRAME_SIZE]) -> Self {
        let mut words = [0u32; 15];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let mut regs = [0u32; PushRegs::WORDS];
        regs.copy_from_slice(&words[..8]);
        Self {
            regs: PushRegs::from_words(regs),
            trapno: words[8],
            err: words[9],
            eip: words[10],
            cs: words[11] as u16,
            eflags: words[12],
            esp: words[13],
            ss: words[14] as u16,
        }
    }
}

/// Fault record pushed on the user exception stack.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct UTrapframe {
    /// Faulting address.
    pub fault_va: u32,
    /// Hardware error code.
    pub err: u32,
    /// Registers at the time of the fault.
    pub regs: PushRegs,
    /// Faulting instruction.
    pub eip: u32,
    /// Flags at the time of the fault.
    pub eflags: u32,
    /// Stack pointer at the time of the fault.
    pub esp: u32,
}

/// Encoded size of [`UTrapframe`].
pub const UTRAPFRAME_SIZE: usize = core::mem::size_of::<UTrapframe>();

static_assertions::const_assert_eq!(UTRAPFRAME_SIZE, 52);

impl UTrapframe {
    /// Captures the record for a fault at `va` interrupting `tf`.
    pub fn capture(va: VirtAddr, code: FaultCode, tf: &Trapframe) -> Self {
        Self {
            fault_va: va.raw(),
            err: code.bits(),
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        }
    }

    /// Faulting address.
    pub const fn va(&self) -> VirtAddr {
        VirtAddr::new(self.fault_va)
    }

    /// Decoded error code.
    pub const fn code(&self) -> FaultCode {
        FaultCode::from_bits_retain(self.err)
    }

    /// Serialises the record to its little-endian stack image.
    pub fn to_le_bytes(&self) -> [u8; UTRAPFRAME_SIZE] {
        let mut words = [0u32; 13];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..10].copy_from_slice(&self.regs.to_words());
        words[10] = self.eip;
        words[11] = self.eflags;
        words[12] = self.esp;

        let mut bytes = [0u8; UTRAPFRAME_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Deserialises a little-endian stack image.
    pub fn from_le_bytes(bytes: [u8; UTRAPFRAME_SIZE]) -> Self {
        let mut words = [0u32; 13];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let mut regs = [0u32; PushRegs::WORDS];
        regs.copy_from_slice(&words[2..10]);
        Self {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs::from_words(regs),
            eip: words[10],
            eflags: words[11],
            esp: words[12],
        }
    }

    /// Writes the resumable part of the record back into `tf`.
    pub fn restore_into(&self, tf: &mut Trapframe) {
        tf.regs = self.regs;
        tf.eip = self.eip;
        tf.eflags = self.eflags;
        tf.esp = self.esp;
    }
}
