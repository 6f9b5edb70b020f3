// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Errors reported by the replication engine.

use cortex_abi::{MemoryFault, SysError, VirtAddr};
use thiserror::Error;

/// Step of a fork that failed. The half-built child is left NotRunnable.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// Installing the COW repair handler in the parent failed.
    #[error("set_pgfault_handler: {0}")]
    Handler(#[source] SysError),
    /// No child could be created.
    #[error("exofork: {0}")]
    Exofork(#[source] SysError),
    /// Duplicating one page into the child failed.
    #[error("duppage {va:?}: {source}")]
    Duppage {
        /// Page being duplicated.
        va: VirtAddr,
        /// Underlying syscall failure.
        #[source]
        source: SysError,
    },
    /// Setting up the child's exception stack failed.
    #[error("exception stack: {0}")]
    ExceptionStack(#[source] SysError),
    /// Copying the exception stack contents faulted.
    #[error("exception stack copy: {0}")]
    StackCopy(#[source] MemoryFault),
    /// Installing the child's upcall failed.
    #[error("set child upcall: {0}")]
    Upcall(#[source] SysError),
    /// Marking the child runnable failed.
    #[error("set child status: {0}")]
    Status(#[source] SysError),
}

impl ForkError {
    /// Syscall error behind this failure, if there is one.
    pub fn sys_error(&self) -> Option<SysError> {
        match *self {
            Self::Handler(err)
            | Self::Exofork(err)
            | Self::ExceptionStack(err)
            | Self::Upcall(err)
            | Self::Status(err) => Some(err),
            Self::Duppage { source, .. } => Some(source),
            Self::StackCopy(_) => None,
        }
    }
}
