// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared across the syscall boundary.

use thiserror::Error;

use crate::env::EnvId;
use crate::layout::VirtAddr;

/// Result type of every syscall.
pub type SysResult<T> = Result<T, SysError>;

/// Errors returned synchronously by syscalls.
///
/// Register encoding is the negated code; see [`SysError::code`].
#[must_use]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum SysError {
    /// Handle is stale, free, or not owned by the caller.
    #[error("bad environment")]
    BadTarget,
    /// Malformed address, alignment, or permission bits.
    #[error("invalid parameter")]
    InvalidArgument,
    /// Frame pool or page-table extension exhausted.
    #[error("out of memory")]
    NoMemory,
    /// Environment table exhausted.
    #[error("out of environments")]
    NoFreeSlot,
    /// Rendezvous target is not blocked in `ipc_recv`.
    #[error("env is not recving")]
    TargetNotReceiving,
}

impl SysError {
    /// Positive error code.
    pub const fn code(self) -> i32 {
        match self {
            Self::BadTarget => 2,
            Self::InvalidArgument => 3,
            Self::NoMemory => 4,
            Self::NoFreeSlot => 5,
            Self::TargetNotReceiving => 7,
        }
    }

    /// Decodes a (positive) error code.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            2 => Some(Self::BadTarget),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::NoMemory),
            5 => Some(Self::NoFreeSlot),
            7 => Some(Self::TargetNotReceiving),
            _ => None,
        }
    }

    /// Encodes a syscall result into the return register.
    pub fn encode(result: SysResult<u32>) -> i32 {
        match result {
            Ok(value) => value as i32,
            Err(err) => -err.code(),
        }
    }

    /// Decodes the return register.
    pub fn decode(raw: i32) -> SysResult<u32> {
        if raw >= 0 {
            return Ok(raw as u32);
        }
        Err(Self::from_code(-raw).unwrap_or(Self::InvalidArgument))
    }
}

/// Raised by user code that cannot continue; the kernel destroys the environment.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("user panic: {reason}")]
pub struct UserPanic {
    /// What went wrong.
    pub reason: &'static str,
    /// Syscall failure that caused it, if any.
    pub cause: Option<SysError>,
}

impl UserPanic {
    /// Panic without an underlying syscall error.
    pub const fn new(reason: &'static str) -> Self {
        Self { reason, cause: None }
    }

    /// Panic caused by a failed syscall.
    pub const fn caused_by(reason: &'static str, cause: SysError) -> Self {
        Self { reason, cause: Some(cause) }
    }
}

/// Outcome of a user load or store that could not be completed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum MemoryFault {
    /// The fault was fatal and the environment was destroyed.
    #[error("environment {env} killed by fault at {va:?}")]
    Killed {
        /// Environment that faulted.
        env: EnvId,
        /// Faulting address.
        va: VirtAddr,
    },
    /// The accessing environment is not running.
    #[error("environment {0} is not running")]
    NotRunning(EnvId),
}
