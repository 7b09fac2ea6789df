// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

/// Errors surfaced by the reader concurrency semaphore.
///
/// The enum is cloneable: a single coalesced memory grant can be awaited by
/// several callers, and `broken()` fans one error out to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A waiter's deadline passed before it was admitted or granted memory.
    #[error("semaphore '{semaphore}' timed out")]
    Timeout { semaphore: String },

    /// The combined wait + ready queue length reached `max_queue_length`.
    #[error("semaphore '{semaphore}': {queue} queue overload")]
    QueueOverload {
        semaphore: String,
        queue: &'static str,
    },

    /// A consume would push consumed memory past the kill limit.
    #[error("semaphore '{semaphore}': consumed memory would exceed the kill limit")]
    OutOfMemory { semaphore: String },

    /// The semaphore was stopped.
    #[error("semaphore '{semaphore}' was stopped")]
    Stopped { semaphore: String },

    /// The semaphore was broken, failing all waiters.
    #[error("semaphore '{semaphore}' was broken")]
    Broken { semaphore: String },

    /// An inactive read handle was routed to a semaphore it does not belong to.
    #[error("inactive read handle belongs to semaphore '{handle_semaphore}', not '{semaphore}'")]
    WrongSemaphore {
        semaphore: String,
        handle_semaphore: String,
    },

    /// A read continuation failed.
    #[error("read failed: {0}")]
    ReadFailed(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::ReadFailed(Arc::new(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
