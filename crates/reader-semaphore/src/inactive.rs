// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::task::AbortHandle;
use tracing::error;

use crate::permit::ReaderPermit;
use crate::reader::Reader;
use crate::semaphore::SemaphoreInner;

/// Why an inactive read was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The semaphore needed the read's resources to admit a waiter.
    Permit,
    /// The read's TTL expired.
    Time,
    /// The caller asked for the eviction.
    Manual,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvictReason::Permit => "permit",
            EvictReason::Time => "time",
            EvictReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

pub(crate) type NotifyHandler = Box<dyn FnOnce(EvictReason) + Send>;

/// A paused reader parked in the semaphore's cache.
pub(crate) struct InactiveRead {
    pub(crate) reader: Box<dyn Reader>,
    pub(crate) permit: ReaderPermit,
    pub(crate) notify_handler: Option<NotifyHandler>,
    pub(crate) ttl_timer: Option<AbortHandle>,
}

/// Handle to a registered inactive read, used to take the reader back out.
///
/// Holds a back-reference to the issuing semaphore so that a handle routed
/// to the wrong instance can be diagnosed.
pub struct InactiveReadHandle {
    pub(crate) inner: Option<(Arc<SemaphoreInner>, u64)>,
}

impl InactiveReadHandle {
    pub(crate) fn attached(semaphore: Arc<SemaphoreInner>, seq: u64) -> Self {
        Self {
            inner: Some((semaphore, seq)),
        }
    }

    pub(crate) fn empty() -> Self {
        Self { inner: None }
    }

    /// True when registration parked the reader. An empty handle means the
    /// reader was evicted on the spot and has already been closed.
    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }
}

impl fmt::Debug for InactiveReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InactiveReadHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// An inactive read pulled out of the cache, with its eviction notification
/// still pending. [`finish`](Self::finish) must run outside the semaphore's
/// state lock: notify handlers are caller code and may call back into the
/// semaphore.
pub(crate) struct DetachedRead {
    pub(crate) reader: Box<dyn Reader>,
    // Dropped here, outside the lock, in case this clone is the last one.
    pub(crate) permit: ReaderPermit,
    pub(crate) notify: Option<(NotifyHandler, EvictReason)>,
}

impl DetachedRead {
    pub(crate) fn finish(self) -> Box<dyn Reader> {
        let DetachedRead {
            reader,
            permit,
            notify,
        } = self;
        if let Some((handler, reason)) = notify {
            if catch_unwind(AssertUnwindSafe(move || handler(reason))).is_err() {
                error!(
                    "evict(): notify handler failed for inactive read evicted due to {}",
                    reason
                );
            }
        }
        drop(permit);
        reader
    }
}
