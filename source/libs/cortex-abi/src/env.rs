// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Environment identifiers, run status and the read-only environment view.

use core::fmt;

use crate::layout::VirtAddr;
use crate::pte::PteFlags;

/// Number of bits of an [`EnvId`] that select the table slot.
pub const LOG2NENV: u32 = 10;
/// Upper bound on environment slots.
pub const NENV: usize = 1 << LOG2NENV;

/// Generation-tagged environment handle: `generation << LOG2NENV | slot`.
///
/// A handle outlives its environment; once the slot is released its generation
/// changes and the stale handle no longer resolves.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Names the calling environment in any syscall taking a target.
    pub const SELF: Self = Self(0);

    /// Builds a handle from a slot and a non-zero generation.
    pub const fn new(slot: usize, generation: u32) -> Self {
        Self((generation << LOG2NENV) | (slot as u32 & (NENV as u32 - 1)))
    }

    /// Reinterprets a raw handle.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw handle.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Slot index encoded in the handle.
    pub const fn slot(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    /// Generation encoded in the handle.
    pub const fn generation(self) -> u32 {
        self.0 >> LOG2NENV
    }

    /// Whether this is [`EnvId::SELF`].
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Run status of an environment slot.
///
/// The discriminants are part of the syscall ABI (`env_set_status`).
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EnvStatus {
    /// Slot unused.
    Free = 0,
    /// Terminated; resources released, slot not yet reusable.
    Dying = 1,
    /// Waiting in the run queue.
    Runnable = 2,
    /// Currently executing.
    Running = 3,
    /// Blocked (fresh child, or waiting in `ipc_recv`).
    NotRunnable = 4,
}

impl TryFrom<u32> for EnvStatus {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Free),
            1 => Ok(Self::Dying),
            2 => Ok(Self::Runnable),
            3 => Ok(Self::Running),
            4 => Ok(Self::NotRunnable),
            other => Err(other),
        }
    }
}

/// Snapshot of an environment as seen through the read-only environment array.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EnvInfo {
    /// Handle of the environment.
    pub id: EnvId,
    /// Creator, `None` for boot environments.
    pub parent: Option<EnvId>,
    /// Run status.
    pub status: EnvStatus,
    /// Blocked in `ipc_recv`.
    pub ipc_recving: bool,
    /// Where the receiver wants a page, if anywhere.
    pub ipc_dstva: Option<VirtAddr>,
    /// Sender of the last delivered message.
    pub ipc_from: Option<EnvId>,
    /// Value of the last delivered message.
    pub ipc_value: u32,
    /// Permissions of the page delivered with the last message; empty if none.
    pub ipc_perm: PteFlags,
    /// Times the environment was scheduled.
    pub runs: u32,
    /// Page faults taken.
    pub page_faults: u32,
    /// Faults delivered to the user upcall.
    pub upcalls: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_encoding() {
        let id = EnvId::new(5, 3);
        assert_eq!(id.as_raw(), 0x0c05);
        assert_eq!(id.slot(), 5);
        assert_eq!(id.generation(), 3);
        assert!(!id.is_self());
        assert!(EnvId::SELF.is_self());
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            EnvStatus::Free,
            EnvStatus::Dying,
            EnvStatus::Runnable,
            EnvStatus::Running,
            EnvStatus::NotRunnable,
        ] {
            assert_eq!(EnvStatus::try_from(status as u32), Ok(status));
        }
        assert_eq!(EnvStatus::try_from(9), Err(9));
    }
}
