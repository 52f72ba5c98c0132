// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! [`BlobHandle`]: the caller-facing wrapper around a reference word.
//!
//! Owns exactly `maxreflen` bytes — the same bytes a caller embeds in its
//! own record — and every operation here reads or rewrites them in place.
//! Structural decisions (inline vs. tree-backed, how many levels, where the
//! value starts) are entirely derived from those bytes; `BlobHandle` itself
//! holds no other state.

use crate::acquire::{self, RegionBuffer};
use crate::block_id::BlockId;
use crate::cache::{AccessMode, Transaction};
use crate::config::BlobStoreConfig;
use crate::error::Result;
use crate::mutator;
use crate::refword;

/// A handle over a single value's reference word.
pub struct BlobHandle {
    ref_buf: Vec<u8>,
    maxreflen: usize,
}

impl BlobHandle {
    /// A fresh, empty (zero-length, inline) reference.
    #[must_use]
    pub fn empty(maxreflen: usize) -> Self {
        let mut ref_buf = vec![0u8; maxreflen];
        refword::set_small_size(&mut ref_buf, 0, maxreflen);
        Self { ref_buf, maxreflen }
    }

    /// Wraps an existing reference word, e.g. one read back out of a record.
    pub fn from_ref(ref_bytes: &[u8], maxreflen: usize) -> Self {
        debug_assert_eq!(ref_bytes.len(), maxreflen);
        Self {
            ref_buf: ref_bytes.to_vec(),
            maxreflen,
        }
    }

    /// The raw reference word, ready to be embedded back into a record.
    /// Only the first [`BlobHandle::refsize`] bytes are meaningful; the rest
    /// pads out to `maxreflen`.
    #[must_use]
    pub fn dump_ref(&self) -> &[u8] {
        &self.ref_buf
    }

    /// Total logical length of the value in bytes.
    #[must_use]
    pub fn valuesize(&self) -> i64 {
        refword::value_size(&self.ref_buf, self.maxreflen)
    }

    /// Number of bytes of the reference word actually in use.
    #[must_use]
    pub fn refsize(&self, config: &BlobStoreConfig) -> usize {
        refword::ref_size(config, &self.ref_buf, self.maxreflen)
    }

    /// Tree depth backing this value (0 for inline).
    #[must_use]
    pub fn ref_levels(&self, config: &BlobStoreConfig) -> i32 {
        refword::ref_levels(config, &self.ref_buf, self.maxreflen)
    }

    /// Exposes `[offset, offset + size)` of the value for reading or
    /// writing. `offset + size` must not exceed [`BlobHandle::valuesize`].
    pub fn expose_region<T: Transaction>(
        &mut self,
        txn: &T,
        config: &BlobStoreConfig,
        mode: AccessMode,
        offset: i64,
        size: i64,
    ) -> Result<RegionBuffer<'_, T::Guard>> {
        acquire::expose_region(txn, config, &mut self.ref_buf, self.maxreflen, mode, offset, size)
    }

    /// Grows the value by `bytes.len()`, placing `bytes` at the end.
    pub fn append<T: Transaction>(&mut self, txn: &T, config: &BlobStoreConfig, bytes: &[u8]) -> Result<()> {
        let old_size = self.valuesize();
        let add = bytes.len() as i64;
        if add == 0 {
            return Ok(());
        }
        let new_size = old_size + add;

        if refword::is_small(&self.ref_buf, self.maxreflen) {
            if refword::size_would_be_small(new_size as usize, self.maxreflen) {
                let old_small = refword::small_size(&self.ref_buf, self.maxreflen);
                refword::set_small_size(&mut self.ref_buf, new_size as usize, self.maxreflen);
                refword::small_buffer_mut(&mut self.ref_buf, self.maxreflen)[old_small..].copy_from_slice(bytes);
                return Ok(());
            }

            let old_bytes = refword::small_buffer(&self.ref_buf, self.maxreflen).to_vec();
            let levels = self.grow_fresh_large(txn, config, new_size)?;
            if !old_bytes.is_empty() {
                let mut region = self.expose_region(txn, config, AccessMode::Write, 0, old_size)?;
                region.write_from(&old_bytes);
            }
            debug_assert_eq!(levels, self.ref_levels(config));
        } else {
            let old_offset = refword::ref_value_offset(&self.ref_buf, self.maxreflen);
            let levels = self.grow_to(txn, config, old_offset, new_size)?;
            debug_assert_eq!(levels, self.ref_levels(config));
        }

        let mut region = self.expose_region(txn, config, AccessMode::Write, old_size, add)?;
        region.write_from(bytes);
        Ok(())
    }

    /// Grows the value by `bytes.len()`, placing `bytes` at the start.
    pub fn prepend<T: Transaction>(&mut self, txn: &T, config: &BlobStoreConfig, bytes: &[u8]) -> Result<()> {
        let old_size = self.valuesize();
        let add = bytes.len() as i64;
        if add == 0 {
            return Ok(());
        }
        let new_size = old_size + add;

        if refword::is_small(&self.ref_buf, self.maxreflen) {
            if refword::size_would_be_small(new_size as usize, self.maxreflen) {
                let old_bytes = refword::small_buffer(&self.ref_buf, self.maxreflen).to_vec();
                refword::set_small_size(&mut self.ref_buf, new_size as usize, self.maxreflen);
                let buf = refword::small_buffer_mut(&mut self.ref_buf, self.maxreflen);
                buf[..add as usize].copy_from_slice(bytes);
                buf[add as usize..].copy_from_slice(&old_bytes);
                return Ok(());
            }

            let old_bytes = refword::small_buffer(&self.ref_buf, self.maxreflen).to_vec();
            let levels = self.grow_fresh_large(txn, config, new_size)?;
            if !old_bytes.is_empty() {
                let mut region = self.expose_region(txn, config, AccessMode::Write, add, old_size)?;
                region.write_from(&old_bytes);
            }
            let mut region = self.expose_region(txn, config, AccessMode::Write, 0, add)?;
            region.write_from(bytes);
            debug_assert_eq!(levels, self.ref_levels(config));
            return Ok(());
        }

        // Already tree-backed: slide left to make room if the current
        // offset doesn't already leave enough slack, then grow into it.
        let mut levels = self.ref_levels(config);
        let old_offset = refword::ref_value_offset(&self.ref_buf, self.maxreflen);
        if old_offset < add {
            let min_shift = add - old_offset;
            loop {
                if mutator::shift_at_least(txn, config, &mut self.ref_buf, self.maxreflen, levels, min_shift)? {
                    break;
                }
                levels = mutator::add_level(txn, config, &mut self.ref_buf, self.maxreflen, levels)?;
            }
        }

        let old_offset = refword::ref_value_offset(&self.ref_buf, self.maxreflen);
        let new_offset = old_offset - add;
        let levels = self.grow_to(txn, config, new_offset, new_size)?;

        let mut region = self.expose_region(txn, config, AccessMode::Write, 0, add)?;
        region.write_from(bytes);
        debug_assert_eq!(levels, self.ref_levels(config));
        Ok(())
    }

    /// Shrinks the value by `remove` bytes, dropping them off the end.
    pub fn unappend<T: Transaction>(&mut self, txn: &T, config: &BlobStoreConfig, remove: i64) -> Result<()> {
        let old_size = self.valuesize();
        debug_assert!((0..=old_size).contains(&remove));
        if remove == 0 {
            return Ok(());
        }
        let new_size = old_size - remove;

        if refword::is_small(&self.ref_buf, self.maxreflen) {
            refword::set_small_size(&mut self.ref_buf, new_size as usize, self.maxreflen);
            return Ok(());
        }

        if refword::size_would_be_small(new_size as usize, self.maxreflen) {
            return self.shrink_large_to_small(txn, config, 0, new_size);
        }

        let offset = refword::ref_value_offset(&self.ref_buf, self.maxreflen);
        let levels = self.ref_levels(config);
        mutator::deallocate_to_dimensions(txn, config, &mut self.ref_buf, self.maxreflen, levels, offset, new_size)?;
        refword::set_big_size(&mut self.ref_buf, self.maxreflen, new_size);
        let levels = self.shrink_levels(txn, config, levels)?;
        debug_assert_eq!(levels, self.ref_levels(config));
        Ok(())
    }

    /// Shrinks the value by `remove` bytes, dropping them off the start.
    pub fn unprepend<T: Transaction>(&mut self, txn: &T, config: &BlobStoreConfig, remove: i64) -> Result<()> {
        let old_size = self.valuesize();
        debug_assert!((0..=old_size).contains(&remove));
        if remove == 0 {
            return Ok(());
        }
        let new_size = old_size - remove;

        if refword::is_small(&self.ref_buf, self.maxreflen) {
            let old_bytes = refword::small_buffer(&self.ref_buf, self.maxreflen).to_vec();
            refword::set_small_size(&mut self.ref_buf, new_size as usize, self.maxreflen);
            refword::small_buffer_mut(&mut self.ref_buf, self.maxreflen).copy_from_slice(&old_bytes[remove as usize..]);
            return Ok(());
        }

        if refword::size_would_be_small(new_size as usize, self.maxreflen) {
            return self.shrink_large_to_small(txn, config, remove, new_size);
        }

        let offset = refword::ref_value_offset(&self.ref_buf, self.maxreflen);
        let levels = self.ref_levels(config);
        let new_offset = offset + remove;
        mutator::deallocate_to_dimensions(txn, config, &mut self.ref_buf, self.maxreflen, levels, new_offset, new_size)?;
        refword::set_big_size(&mut self.ref_buf, self.maxreflen, new_size);
        refword::set_big_offset(&mut self.ref_buf, self.maxreflen, new_offset);
        let levels = self.shrink_levels(txn, config, levels)?;
        debug_assert_eq!(levels, self.ref_levels(config));
        Ok(())
    }

    /// Builds a brand-new, empty tree sized to hold exactly `target_size`
    /// bytes at absolute offset 0. Leaves every byte of that window
    /// unwritten — callers fill it via [`BlobHandle::expose_region`]
    /// immediately afterward.
    fn grow_fresh_large<T: Transaction>(&mut self, txn: &T, config: &BlobStoreConfig, target_size: i64) -> Result<i32> {
        debug_assert!(!refword::size_would_be_small(target_size as usize, self.maxreflen));

        refword::mark_large(&mut self.ref_buf, self.maxreflen);
        refword::set_big_size(&mut self.ref_buf, self.maxreflen, 0);
        refword::set_big_offset(&mut self.ref_buf, self.maxreflen, 0);
        for i in 0..refword::root_fanout_max(self.maxreflen) as usize {
            refword::set_root_block_id(&mut self.ref_buf, self.maxreflen, i, BlockId::NULL);
        }

        let mut levels = 0;
        loop {
            if mutator::allocate_to_dimensions(txn, config, &mut self.ref_buf, self.maxreflen, levels, 0, target_size)? {
                break;
            }
            levels = mutator::add_level(txn, config, &mut self.ref_buf, self.maxreflen, levels)?;
        }
        refword::set_big_size(&mut self.ref_buf, self.maxreflen, target_size);
        Ok(levels)
    }

    /// Grows an already tree-backed value to cover `[new_offset, new_offset
    /// + new_size)`, adding levels of indirection as needed. Must only be
    /// called when the value is already large — the bound check it relies
    /// on (reading the current offset/size back out of the ref word)
    /// assumes that invariant.
    fn grow_to<T: Transaction>(&mut self, txn: &T, config: &BlobStoreConfig, new_offset: i64, new_size: i64) -> Result<i32> {
        let mut levels = self.ref_levels(config);
        loop {
            if mutator::allocate_to_dimensions(txn, config, &mut self.ref_buf, self.maxreflen, levels, new_offset, new_size)? {
                refword::set_big_size(&mut self.ref_buf, self.maxreflen, new_size);
                refword::set_big_offset(&mut self.ref_buf, self.maxreflen, new_offset);
                return Ok(levels);
            }
            levels = mutator::add_level(txn, config, &mut self.ref_buf, self.maxreflen, levels)?;
        }
    }

    /// Reads `[local_offset, local_offset + new_size)` back out of the
    /// current tree, frees the whole tree, and re-settles the value as an
    /// inline reference. Used when a shrink crosses below the inline
    /// threshold — a large-formatted reference is never left with a size
    /// that would also fit inline.
    fn shrink_large_to_small<T: Transaction>(
        &mut self,
        txn: &T,
        config: &BlobStoreConfig,
        local_offset: i64,
        new_size: i64,
    ) -> Result<()> {
        let levels = self.ref_levels(config);
        let offset = refword::ref_value_offset(&self.ref_buf, self.maxreflen);

        let kept_bytes = {
            let region = self.expose_region(txn, config, AccessMode::Read, local_offset, new_size)?;
            region.read_to_vec()
        };

        mutator::deallocate_to_dimensions(txn, config, &mut self.ref_buf, self.maxreflen, levels, offset, 0)?;

        *self = Self::empty(self.maxreflen);
        if !kept_bytes.is_empty() {
            refword::set_small_size(&mut self.ref_buf, kept_bytes.len(), self.maxreflen);
            refword::small_buffer_mut(&mut self.ref_buf, self.maxreflen).copy_from_slice(&kept_bytes);
        }
        Ok(())
    }

    /// Unwraps levels of indirection while the value still fits under one
    /// fewer. `levels` must be the tree's actual current depth, not a
    /// recomputed minimum — this runs right after a shrink has already
    /// updated the size/offset fields but before the physical tree has
    /// caught up.
    fn shrink_levels<T: Transaction>(&mut self, txn: &T, config: &BlobStoreConfig, mut levels: i32) -> Result<i32> {
        while let Some(new_levels) = mutator::remove_level(txn, config, &mut self.ref_buf, self.maxreflen, levels)? {
            levels = new_levels;
        }
        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;

    fn cfg() -> BlobStoreConfig {
        BlobStoreConfig::new(256, 32).max_concurrent_io_requests(4)
    }

    #[test]
    fn empty_handle_is_zero_length_inline() {
        let handle = BlobHandle::empty(32);
        assert_eq!(handle.valuesize(), 0);
    }

    #[test]
    fn small_append_stays_inline() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, b"hello").unwrap();
        assert_eq!(handle.valuesize(), 5);
        assert_eq!(handle.ref_levels(&config), 0);

        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, 5).unwrap();
        assert_eq!(region.read_to_vec(), b"hello");
    }

    #[test]
    fn append_past_inline_threshold_converts_to_large() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, &[0xAAu8; 10]).unwrap();
        handle.append(&txn, &config, &[0xBBu8; 5000]).unwrap();

        assert!(handle.ref_levels(&config) >= 1);
        assert_eq!(handle.valuesize(), 5010);

        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, 10).unwrap();
        assert_eq!(region.read_to_vec(), vec![0xAAu8; 10]);
        let region = handle.expose_region(&txn, &config, AccessMode::Read, 10, 5000).unwrap();
        assert_eq!(region.read_to_vec(), vec![0xBBu8; 5000]);
    }

    #[test]
    fn prepend_before_inline_threshold_stays_inline() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, b"world").unwrap();
        handle.prepend(&txn, &config, b"hello ").unwrap();

        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, handle.valuesize()).unwrap();
        assert_eq!(region.read_to_vec(), b"hello world");
    }

    #[test]
    fn prepend_past_threshold_converts_to_large_with_correct_layout() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, &[1u8; 10]).unwrap();
        handle.prepend(&txn, &config, &[2u8; 5000]).unwrap();

        assert!(handle.ref_levels(&config) >= 1);
        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, handle.valuesize()).unwrap();
        let bytes = region.read_to_vec();
        assert_eq!(&bytes[..5000], &[2u8; 5000][..]);
        assert_eq!(&bytes[5000..], &[1u8; 10][..]);
    }

    #[test]
    fn unappend_below_threshold_returns_to_inline() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8).collect();
        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, &payload).unwrap();
        assert!(handle.ref_levels(&config) >= 1);

        handle.unappend(&txn, &config, 4990).unwrap();
        assert_eq!(handle.valuesize(), 10);
        assert_eq!(handle.ref_levels(&config), 0);

        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, 10).unwrap();
        assert_eq!(region.read_to_vec(), &payload[..10]);
    }

    #[test]
    fn unprepend_below_threshold_returns_to_inline_with_tail_kept() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 181) as u8).collect();
        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, &payload).unwrap();

        handle.unprepend(&txn, &config, 4990).unwrap();
        assert_eq!(handle.valuesize(), 10);
        assert_eq!(handle.ref_levels(&config), 0);

        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, 10).unwrap();
        assert_eq!(region.read_to_vec(), &payload[4990..]);
    }

    #[test]
    fn unappend_keeps_large_shrinks_levels_back_down() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 173) as u8).collect();
        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, &payload).unwrap();
        let deep_levels = handle.ref_levels(&config);
        assert!(deep_levels >= 2);

        handle.unappend(&txn, &config, 190_000).unwrap();
        assert_eq!(handle.valuesize(), 10_000);
        assert!(handle.ref_levels(&config) < deep_levels);

        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, 10_000).unwrap();
        assert_eq!(region.read_to_vec(), &payload[..10_000]);
    }

    #[test]
    fn from_ref_round_trips_through_dump_ref() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, b"round trip me").unwrap();
        let dumped = handle.dump_ref().to_vec();

        let mut reloaded = BlobHandle::from_ref(&dumped, config.maxreflen);
        let region = reloaded.expose_region(&txn, &config, AccessMode::Read, 0, 13).unwrap();
        assert_eq!(region.read_to_vec(), b"round trip me");
    }
}
