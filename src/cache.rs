// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The buffer cache seam.
//!
//! The blob engine is written against the [`Transaction`]/[`BlockGuard`]
//! traits, not against any concrete cache — a real node wires those traits
//! up to its transactional, write-ahead-logged buffer cache (out of scope
//! here). [`MemCache`] is the reference implementation used by this
//! crate's own tests and examples: blocks live in a `quick_cache`
//! read-through cache backed by a single flat file, with physical I/O
//! funneled through a [`DiskPool`](crate::diskpool::DiskPool).

use crate::block_id::BlockId;
use crate::config::BlobStoreConfig;
use crate::diskpool::{DiskPool, IoAction, IoKind};
use crate::error::{Error, Result};

use quick_cache::sync::Cache;
use quick_cache::Weighter;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Whether a block is being acquired for reading or for writing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

#[must_use]
pub fn is_read_mode(mode: AccessMode) -> bool {
    mode == AccessMode::Read
}

/// A held lock on a single block. Acquired, used, and released within one
/// blob operation — never held across an `await`/suspension boundary by a
/// caller of this crate.
pub trait BlockGuard {
    fn block_id(&self) -> BlockId;
    fn data_read(&self) -> &[u8];
    fn data_write(&mut self) -> &mut [u8];
}

/// The scope within which block acquisitions are valid. On abort, all
/// acquisitions made through it must be considered released and any
/// in-progress structural mutation must not reach the reference word.
pub trait Transaction: Sync {
    type Guard: BlockGuard + Send;

    fn block_size(&self) -> usize;

    /// Acquires an existing block. Suspends (in a real cache) on a miss.
    fn acquire(&self, id: BlockId, mode: AccessMode) -> Result<Self::Guard>;

    /// Allocates a fresh block from the cache in write mode. Its contents
    /// are unspecified until the caller stamps a magic header.
    fn allocate(&self) -> Result<Self::Guard>;

    /// Returns a block to the cache's free pool.
    fn free(&self, id: BlockId) -> Result<()>;

    /// Whether the enclosing transaction has already been cancelled.
    fn is_aborted(&self) -> bool {
        false
    }
}

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<BlockId, Arc<[u8]>> for BlockWeighter {
    fn weight(&self, _key: &BlockId, _block: &Arc<[u8]>) -> u64 {
        1
    }
}

struct MemCacheInner {
    file: Arc<File>,
    disk: DiskPool,
    block_size: usize,
    next_block_id: AtomicU64,
    free_list: Mutex<Vec<BlockId>>,
    read_cache: Cache<BlockId, Arc<[u8]>, BlockWeighter, rustc_hash::FxBuildHasher>,
}

/// Reference buffer cache backing tests and examples in this crate.
///
/// Not a production buffer cache: no write-ahead log, no crash recovery,
/// no eviction beyond the bounded read cache. It exists so the blob engine
/// has something real to run against.
#[derive(Clone)]
pub struct MemCache {
    inner: Arc<MemCacheInner>,
}

impl MemCache {
    /// Opens (creating if absent) a backing file sized for `block_size`
    /// blocks, with I/O dispatched through a pool sized per `config`.
    pub fn open(file: File, config: &BlobStoreConfig) -> Result<Self> {
        let disk = DiskPool::new(config);
        let byte_len = file.metadata()?.len();
        let next_block_id = byte_len / config.block_size as u64;

        Ok(Self {
            inner: Arc::new(MemCacheInner {
                file: Arc::new(file),
                disk,
                block_size: config.block_size as usize,
                next_block_id: AtomicU64::new(next_block_id),
                free_list: Mutex::new(Vec::new()),
                read_cache: Cache::with(
                    1_000,
                    10_000,
                    BlockWeighter,
                    Default::default(),
                    quick_cache::sync::DefaultLifecycle::default(),
                ),
            }),
        })
    }

    /// Opens a throwaway, unlinked backing file — handy for tests.
    pub fn open_temporary(config: &BlobStoreConfig) -> Result<Self> {
        Self::open(tempfile::tempfile()?, config)
    }

    /// A transaction handle borrowing this cache. Cheap: the underlying
    /// cache is reference-counted, acquiring/allocating/freeing all act
    /// directly on it (there is no separate commit/rollback log here).
    #[must_use]
    pub fn begin(&self) -> MemTxn {
        MemTxn {
            inner: Arc::clone(&self.inner),
        }
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.inner.next_block_id.load(Ordering::Acquire)
    }
}

impl MemCacheInner {
    fn read_block(&self, id: BlockId) -> Result<Vec<u8>> {
        if let Some(cached) = self.read_cache.get(&id) {
            return Ok(cached.to_vec());
        }

        let (tx, rx) = mpsc::channel();
        self.disk.submit(IoAction {
            file: Arc::clone(&self.file),
            kind: IoKind::Read,
            buf: vec![0u8; self.block_size],
            offset: id.0 * self.block_size as u64,
            on_complete: Box::new(move |buf| {
                let _ = tx.send(buf);
            }),
        });
        let data = rx.recv().map_err(|_| Error::TransactionAborted)?;
        self.read_cache.insert(id, Arc::from(data.as_slice()));
        Ok(data)
    }

    fn write_block(&self, id: BlockId, data: Vec<u8>) -> Result<()> {
        self.read_cache.insert(id, Arc::from(data.as_slice()));

        let (tx, rx) = mpsc::channel();
        self.disk.submit(IoAction {
            file: Arc::clone(&self.file),
            kind: IoKind::Write,
            buf: data,
            offset: id.0 * self.block_size as u64,
            on_complete: Box::new(move |_| {
                let _ = tx.send(());
            }),
        });
        rx.recv().map_err(|_| Error::TransactionAborted)
    }

    fn allocate_block(&self) -> Result<BlockId> {
        if let Some(id) = self.free_list.lock().expect("free list poisoned").pop() {
            return Ok(id);
        }

        let id = BlockId(self.next_block_id.fetch_add(1, Ordering::AcqRel));
        self.file
            .set_len((id.0 + 1) * self.block_size as u64)
            .map_err(Error::Io)?;
        Ok(id)
    }
}

/// A [`Transaction`] over a [`MemCache`].
#[derive(Clone)]
pub struct MemTxn {
    inner: Arc<MemCacheInner>,
}

pub struct MemBlockGuard {
    inner: Arc<MemCacheInner>,
    id: BlockId,
    mode: AccessMode,
    data: Vec<u8>,
    dirty: bool,
}

impl BlockGuard for MemBlockGuard {
    fn block_id(&self) -> BlockId {
        self.id
    }

    fn data_read(&self) -> &[u8] {
        &self.data
    }

    fn data_write(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.mode, AccessMode::Write, "acquired read-only");
        self.dirty = true;
        &mut self.data
    }
}

impl Drop for MemBlockGuard {
    fn drop(&mut self) {
        if self.dirty {
            // Best-effort: a real cache would mark this dirty and flush
            // asynchronously under the WAL; here we just write through.
            let data = std::mem::take(&mut self.data);
            if let Err(e) = self.inner.write_block(self.id, data) {
                log::error!("failed to flush block {}: {e}", self.id);
            }
        }
    }
}

impl Transaction for MemTxn {
    type Guard = MemBlockGuard;

    fn block_size(&self) -> usize {
        self.inner.block_size
    }

    fn acquire(&self, id: BlockId, mode: AccessMode) -> Result<Self::Guard> {
        let data = self.inner.read_block(id)?;
        Ok(MemBlockGuard {
            inner: Arc::clone(&self.inner),
            id,
            mode,
            data,
            dirty: false,
        })
    }

    fn allocate(&self) -> Result<Self::Guard> {
        let id = self.inner.allocate_block()?;
        Ok(MemBlockGuard {
            inner: Arc::clone(&self.inner),
            id,
            mode: AccessMode::Write,
            data: vec![0u8; self.inner.block_size],
            dirty: true,
        })
    }

    fn free(&self, id: BlockId) -> Result<()> {
        self.inner
            .free_list
            .lock()
            .expect("free list poisoned")
            .push(id);
        Ok(())
    }
}
