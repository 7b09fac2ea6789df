// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io;
use std::ops::Deref;

use async_trait::async_trait;
use bytes::Bytes;

use crate::permit::{ReaderPermit, ResourceUnits};

/// A buffer produced by a bulk file read, optionally carrying the memory
/// charge for its bytes. Dropping the buffer releases the charge.
pub struct FileBuffer {
    bytes: Bytes,
    _units: Option<ResourceUnits>,
}

impl FileBuffer {
    pub fn untracked(bytes: Bytes) -> Self {
        Self {
            bytes,
            _units: None,
        }
    }

    pub fn tracked(bytes: Bytes, units: ResourceUnits) -> Self {
        Self {
            bytes,
            _units: Some(units),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Detaches the bytes, releasing the memory charge immediately.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Deref for FileBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for FileBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// The slice of file I/O the admission core needs to see. The actual
/// on-disk file is an external collaborator.
#[async_trait]
pub trait ReadableFile: Send + Sync + 'static {
    /// Reads `range_size` bytes starting at `offset`.
    async fn read_bulk(&self, offset: u64, range_size: usize) -> io::Result<FileBuffer>;

    async fn size(&self) -> io::Result<u64>;

    async fn close(&self) -> io::Result<()>;
}

/// A file wrapper that makes read-side memory usage visible to the
/// semaphore.
///
/// Every operation delegates unchanged to the wrapped (untracked) file,
/// except bulk reads: those first charge the read size to the permit via
/// [`ReaderPermit::request_memory`] and attach the resulting guard to the
/// returned buffer, so the charge lives exactly as long as the bytes do.
pub struct TrackedFile<F> {
    file: F,
    permit: ReaderPermit,
}

impl<F> TrackedFile<F> {
    pub fn new(file: F, permit: ReaderPermit) -> Self {
        Self { file, permit }
    }

    pub fn permit(&self) -> &ReaderPermit {
        &self.permit
    }

    pub fn into_inner(self) -> F {
        self.file
    }
}

#[async_trait]
impl<F: ReadableFile> ReadableFile for TrackedFile<F> {
    async fn read_bulk(&self, offset: u64, range_size: usize) -> io::Result<FileBuffer> {
        let units = self
            .permit
            .request_memory(range_size as u64)
            .await
            .map_err(io::Error::other)?;
        let buffer = self.file.read_bulk(offset, range_size).await?;
        Ok(FileBuffer::tracked(buffer.into_bytes(), units))
    }

    async fn size(&self) -> io::Result<u64> {
        self.file.size().await
    }

    async fn close(&self) -> io::Result<()> {
        self.file.close().await
    }
}

pub fn make_tracked_file<F: ReadableFile>(file: F, permit: ReaderPermit) -> TrackedFile<F> {
    TrackedFile::new(file, permit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_buffer_exposes_bytes() {
        let buffer = FileBuffer::untracked(Bytes::from_static(b"payload"));
        assert_eq!(&*buffer, b"payload");
        assert_eq!(buffer.len(), 7);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.into_bytes(), Bytes::from_static(b"payload"));
    }
}
