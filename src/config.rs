// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::block_id::BlockId;

/// Default number of worker threads servicing the disk pool.
pub const DEFAULT_MAX_CONCURRENT_IO_REQUESTS: usize = 64;

/// Configuration shared by the blob engine and its backing buffer cache.
#[derive(Clone, Debug)]
pub struct BlobStoreConfig {
    /// Size, in bytes, of a single cache block (and thus of a leaf/internal
    /// tree node). Fixed per store.
    pub block_size: u32,

    /// Width, in bytes, of the reference word a caller embeds in its own
    /// record. Common choices are 251 (fits a single-byte size discriminator)
    /// or larger for record types that want deeper inlining.
    pub maxreflen: usize,

    /// Upper bound on physically in-flight `pread`/`pwrite` calls. The disk
    /// pool additionally allows up to `3 * max_concurrent_io_requests`
    /// actions to be dequeued from the producer before it stops pulling.
    pub max_concurrent_io_requests: usize,
}

impl BlobStoreConfig {
    #[must_use]
    pub fn new(block_size: u32, maxreflen: usize) -> Self {
        Self {
            block_size,
            maxreflen,
            max_concurrent_io_requests: DEFAULT_MAX_CONCURRENT_IO_REQUESTS,
        }
    }

    #[must_use]
    pub fn max_concurrent_io_requests(mut self, n: usize) -> Self {
        self.max_concurrent_io_requests = n;
        self
    }

    /// Number of bytes usable for raw value data inside one leaf block.
    #[must_use]
    pub fn leaf_size(&self) -> usize {
        self.block_size as usize - crate::block::MAGIC_LEN
    }

    /// Number of `BlockId` slots an internal block can hold.
    #[must_use]
    pub fn internal_fanout(&self) -> usize {
        (self.block_size as usize - crate::block::MAGIC_LEN) / BlockId::SERIALIZED_LEN
    }
}
