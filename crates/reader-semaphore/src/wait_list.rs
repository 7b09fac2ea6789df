// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Result;
use crate::permit::ReaderPermit;
use crate::semaphore::ReadFunc;

/// A not-yet-admitted (or memory-starved) read waiting its turn.
pub(crate) struct WaitEntry {
    pub(crate) permit: ReaderPermit,
    pub(crate) tx: oneshot::Sender<Result<()>>,
    pub(crate) func: Option<ReadFunc>,
    pub(crate) timeout: Instant,
}

/// Two FIFO queues sharing one expiry timer: reads waiting to be admitted
/// and admitted reads waiting for memory. Memory waiters go first; they
/// belong to already admitted reads, and finishing those is what frees
/// memory.
#[derive(Default)]
pub(crate) struct WaitList {
    admission: VecDeque<WaitEntry>,
    memory: VecDeque<WaitEntry>,
}

impl WaitList {
    pub(crate) fn is_empty(&self) -> bool {
        self.admission.is_empty() && self.memory.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.admission.len() + self.memory.len()
    }

    pub(crate) fn push_admission(&mut self, entry: WaitEntry) {
        self.admission.push_back(entry);
    }

    pub(crate) fn push_memory(&mut self, entry: WaitEntry) {
        self.memory.push_back(entry);
    }

    pub(crate) fn front(&self) -> Option<&WaitEntry> {
        self.memory.front().or_else(|| self.admission.front())
    }

    pub(crate) fn pop_front(&mut self) -> Option<WaitEntry> {
        if self.memory.is_empty() {
            self.admission.pop_front()
        } else {
            self.memory.pop_front()
        }
    }

    /// The earliest deadline across both queues, for arming the expiry
    /// timer.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.admission
            .iter()
            .chain(self.memory.iter())
            .map(|e| e.timeout)
            .min()
    }

    /// Removes and returns every entry whose deadline has passed.
    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<WaitEntry> {
        let mut expired = Vec::new();
        for queue in [&mut self.admission, &mut self.memory] {
            let mut keep = VecDeque::with_capacity(queue.len());
            for entry in std::mem::take(queue) {
                if entry.timeout <= now {
                    expired.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *queue = keep;
        }
        expired
    }

    pub(crate) fn drain_all(&mut self) -> Vec<WaitEntry> {
        self.memory
            .drain(..)
            .chain(self.admission.drain(..))
            .collect()
    }
}
