// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Admission control and resource accounting for shard-local reads.
//!
//! Every logical read obtains a [`ReaderPermit`] from its shard's
//! [`ReaderConcurrencySemaphore`]. The permit tracks the read's resource
//! consumption across its whole lifecycle; the semaphore admits, defers, or
//! sheds reads to keep the total in-flight footprint within a configured
//! `(count, memory)` envelope.
//!
//! # Memory pressure
//!
//! Reads may over-commit memory. Past the **serialize limit** (initial
//! memory times a configurable multiplier) only one *blessed* permit may
//! keep growing while everybody else queues, which prevents deadlock when a
//! single large read needs more memory than the shared pool holds. Past the
//! **kill limit**, consuming more memory fails the read with
//! [`Error::OutOfMemory`].
//!
//! # Inactive reads
//!
//! A reader that produced a page and expects to be resumed later can be
//! parked in the semaphore's inactive-read cache with
//! [`ReaderConcurrencySemaphore::register_inactive_read`]. Parked readers
//! are the semaphore's eviction reserve: when a new read cannot be admitted
//! for lack of resources, inactive reads are evicted (closed) one at a time
//! until the waiters fit.

mod diagnostics;
mod error;
mod inactive;
pub mod metric_definitions;
mod permit;
mod reader;
mod resources;
mod schema;
mod semaphore;
mod tracking_file;
mod wait_list;

pub use error::{Error, Result};
pub use inactive::{EvictReason, InactiveReadHandle};
pub use permit::{MaxResultSize, PermitSnapshot, PermitState, ReaderPermit, ResourceUnits};
pub use reader::Reader;
pub use resources::ReaderResources;
pub use schema::{Schema, SchemaRef, TableId};
pub use semaphore::{far_future, ReadFunc, ReaderConcurrencySemaphore, SemaphoreStats};
pub use tracking_file::{make_tracked_file, FileBuffer, ReadableFile, TrackedFile};
