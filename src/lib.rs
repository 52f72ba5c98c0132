// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Large-value storage core for a distributed key-value node.
//!
//! A value is addressed through a fixed-width *reference word* embedded in
//! the caller's own record. Small values live inline in that word; larger
//! ones are stored as a multi-level tree of fixed-size cache blocks, with
//! the reference word holding only the root of the tree plus enough
//! bookkeeping (byte offset, size, level count) to navigate it.
//!
//! ```
//! use blobstore::{AccessMode, BlobHandle, BlobStoreConfig, MemCache};
//!
//! let config = BlobStoreConfig::new(4096, 251);
//! let cache = MemCache::open_temporary(&config)?;
//! let txn = cache.begin();
//!
//! let mut handle = BlobHandle::empty(config.maxreflen);
//! handle.append(&txn, &config, b"hello, world")?;
//!
//! let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, handle.valuesize())?;
//! assert_eq!(region.read_to_vec(), b"hello, world");
//! # Ok::<(), blobstore::Error>(())
//! ```
//!
//! # Module map
//!
//! - [`refword`] — pure arithmetic over the reference word's bytes.
//! - [`block`] — on-disk layout of leaf and internal tree blocks.
//! - [`cache`] — the [`Transaction`](cache::Transaction)/[`BlockGuard`](cache::BlockGuard)
//!   seam a real buffer cache implements, plus [`MemCache`] for tests.
//! - [`diskpool`] — the bounded worker-thread pool backing [`MemCache`]'s I/O.
//! - [`acquire`] — turns a byte window into a [`RegionBuffer`](acquire::RegionBuffer).
//! - [`mutator`] — structural tree mutation: grow, shrink, add/remove a level, shift.
//! - [`handle`] — [`BlobHandle`], the type callers actually hold.

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod acquire;
pub mod block;
pub mod block_id;
pub mod cache;
pub mod config;
pub mod diskpool;
pub mod error;
pub mod handle;
pub mod mutator;
pub mod refword;

pub use acquire::RegionBuffer;
pub use block_id::BlockId;
pub use cache::{AccessMode, BlockGuard, MemCache, MemBlockGuard, MemTxn, Transaction};
pub use config::{BlobStoreConfig, DEFAULT_MAX_CONCURRENT_IO_REQUESTS};
pub use diskpool::DiskPool;
pub use error::{Error, Result};
pub use handle::BlobHandle;
