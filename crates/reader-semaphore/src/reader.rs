// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use async_trait::async_trait;

use crate::permit::ReaderPermit;
use crate::schema::SchemaRef;

/// The slice of a query reader the admission core interacts with.
///
/// The reader itself, a closeable stream of query results, is an external
/// collaborator. The semaphore only parks readers in its inactive cache,
/// closes them on eviction, and inspects their schema identity for
/// per-table eviction.
#[async_trait]
pub trait Reader: Send + 'static {
    /// The permit this reader charges its resources to.
    fn permit(&self) -> ReaderPermit;

    /// The schema the reader was opened against.
    fn schema(&self) -> SchemaRef;

    /// Releases the reader's buffers and I/O state. Must be called before
    /// drop; the semaphore does so for every reader it evicts.
    async fn close(&mut self);
}
