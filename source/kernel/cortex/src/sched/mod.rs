// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cooperative round-robin run queue
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/enqueue/purge/next/len), EnqueueOutcome, EnqueueRejectReason
//! DEPENDS_ON: cortex_abi::EnvId
//! INVARIANTS: Bounded queue capacity with deterministic reject on saturation; an id is queued at most once

extern crate alloc;

use alloc::collections::VecDeque;
use cortex_abi::EnvId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejectReason {
    QueueFull { capacity: usize },
    AlreadyQueued,
}

#[must_use = "enqueue outcomes must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Rejected(EnqueueRejectReason),
}

/// FIFO of runnable environments.
///
/// Status bookkeeping lives in the environment table; the queue only orders
/// handles. A handle may go stale while queued, so callers re-validate what
/// [`next`](Self::next) returns.
pub struct Scheduler {
    queue: VecDeque<EnvId>,
    capacity: usize,
}

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        Self { queue: VecDeque::with_capacity(capacity), capacity }
    }

    /// Appends `id` to the tail of the run queue.
    pub fn enqueue(&mut self, id: EnvId) -> EnqueueOutcome {
        if self.queue.contains(&id) {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::AlreadyQueued);
        }
        if self.queue.len() >= self.capacity {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::QueueFull {
                capacity: self.capacity,
            });
        }
        self.queue.push_back(id);
        EnqueueOutcome::Enqueued
    }

    /// Removes every queued occurrence of `id`.
    pub fn purge(&mut self, id: EnvId) {
        self.queue.retain(|queued| *queued != id);
    }

    /// Pops the head of the run queue.
    pub fn next(&mut self) -> Option<EnvId> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, id: EnvId) -> bool {
        self.queue.contains(&id)
    }
}
