// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Structural mutation of a large value's block tree: growing or shrinking
//! its footprint (`allocate_to_dimensions` / `deallocate_to_dimensions`),
//! adding or removing a level of indirection, and sliding an existing
//! window to a new position (`shift_at_least`) to make room for a prepend.
//!
//! Everything here operates on an explicit root `BlockId` array and level
//! count rather than on a reference word directly; [`crate::handle`] owns
//! reading that array out of the ref, calling into this module, and
//! writing the (possibly relocated) array back.

use crate::acquire;
use crate::block;
use crate::block_id::BlockId;
use crate::cache::{AccessMode, BlockGuard, Transaction};
use crate::config::BlobStoreConfig;
use crate::error::Result;
use crate::refword;

pub(crate) fn read_root_ids(ref_buf: &[u8], maxreflen: usize) -> Vec<BlockId> {
    let n = refword::root_fanout_max(maxreflen) as usize;
    (0..n).map(|i| refword::root_block_id(ref_buf, maxreflen, i)).collect()
}

pub(crate) fn write_root_ids(ref_buf: &mut [u8], maxreflen: usize, ids: &[BlockId]) {
    for (i, id) in ids.iter().enumerate() {
        refword::set_root_block_id(ref_buf, maxreflen, i, *id);
    }
}

/// Grows (never shrinks) the child array at `index` to cover
/// `[new_offset, new_offset + new_size)`, allocating a fresh block if this
/// slot wasn't part of the old footprint at all.
#[allow(clippy::too_many_arguments)]
fn allocate_index<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    levels: i32,
    ids: &mut [BlockId],
    index: usize,
    old_offset: i64,
    old_size: i64,
    new_offset: i64,
    new_size: i64,
) -> Result<()> {
    let (sub_old_offset, sub_old_size) = refword::shrink_local(config, levels, old_offset, old_size, index as i64);
    let (sub_new_offset, sub_new_size) = refword::shrink_local(config, levels, new_offset, new_size, index as i64);

    let mut guard = if sub_old_size > 0 {
        txn.acquire(ids[index], AccessMode::Write)?
    } else {
        let guard = txn.allocate()?;
        ids[index] = guard.block_id();
        guard
    };

    if sub_old_size <= 0 {
        let data = guard.data_write();
        if levels == 1 {
            block::init_leaf(data);
        } else {
            block::init_internal(data);
        }
    }

    if levels > 1 {
        let mut sub_ids = block::internal_block_ids(guard.data_read(), config);
        allocate_recursively(
            txn,
            config,
            levels - 1,
            &mut sub_ids,
            sub_old_offset,
            sub_old_size,
            sub_new_offset,
            sub_new_size,
        )?;
        let data = guard.data_write();
        for (i, id) in sub_ids.iter().enumerate() {
            block::set_internal_block_id(data, i, *id);
        }
    }

    Ok(())
}

/// Extends every child slice that grew between the old and new windows.
/// Slices fully inside both windows are untouched.
fn allocate_recursively<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    levels: i32,
    ids: &mut [BlockId],
    old_offset: i64,
    old_size: i64,
    new_offset: i64,
    new_size: i64,
) -> Result<()> {
    let (old_lo, old_hi) = refword::compute_acquisition_range(config, levels, old_offset, old_size);
    let (new_lo, new_hi) = refword::compute_acquisition_range(config, levels, new_offset, new_size);
    let leaf_size = config.leaf_size() as i64;

    if new_offset / leaf_size < old_offset / leaf_size {
        for i in new_lo..=old_lo {
            allocate_index(txn, config, levels, ids, i as usize, old_offset, old_size, new_offset, new_size)?;
        }
    }
    if refword::ceil_divide(new_offset + new_size, leaf_size) > refword::ceil_divide(old_offset + old_size, leaf_size) {
        let start = (old_lo + 1).max(old_hi - 1);
        for i in start..new_hi {
            allocate_index(txn, config, levels, ids, i as usize, old_offset, old_size, new_offset, new_size)?;
        }
    }
    Ok(())
}

/// Grows the root-level footprint to `[new_offset, new_offset + new_size)`.
/// Returns `false` (without touching anything) if that window doesn't fit
/// within `levels` worth of capacity — the caller must [`add_level`] first.
pub(crate) fn allocate_to_dimensions<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    ref_buf: &mut [u8],
    maxreflen: usize,
    levels: i32,
    new_offset: i64,
    new_size: i64,
) -> Result<bool> {
    let old_offset = refword::ref_value_offset(ref_buf, maxreflen);
    let old_size = refword::value_size(ref_buf, maxreflen);
    let old_end = old_offset + old_size;
    let new_end = new_offset + new_size;
    debug_assert!(new_offset <= old_offset && new_end >= old_end);

    if new_offset >= 0 && new_end <= refword::max_end_offset(config, levels, maxreflen) {
        if levels != 0 {
            let mut ids = read_root_ids(ref_buf, maxreflen);
            allocate_recursively(txn, config, levels, &mut ids, old_offset, old_size, new_offset, new_size)?;
            write_root_ids(ref_buf, maxreflen, &ids);
        }
        Ok(true)
    } else {
        Ok(false)
    }
}

#[allow(clippy::too_many_arguments)]
fn deallocate_index<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    levels: i32,
    ids: &mut [BlockId],
    index: usize,
    old_offset: i64,
    old_size: i64,
    new_offset: i64,
    new_size: i64,
) -> Result<()> {
    let (sub_old_offset, sub_old_size) = refword::shrink_local(config, levels, old_offset, old_size, index as i64);
    let (sub_new_offset, sub_new_size) = refword::shrink_local(config, levels, new_offset, new_size, index as i64);

    if sub_new_size > 0 {
        if levels > 1 {
            let mut guard = txn.acquire(ids[index], AccessMode::Write)?;
            let mut sub_ids = block::internal_block_ids(guard.data_read(), config);
            deallocate_recursively(txn, config, levels - 1, &mut sub_ids, sub_old_offset, sub_old_size, sub_new_offset, sub_new_size)?;
            let data = guard.data_write();
            for (i, id) in sub_ids.iter().enumerate() {
                block::set_internal_block_id(data, i, *id);
            }
        }
    } else if sub_old_size > 0 {
        if levels > 1 {
            let guard = txn.acquire(ids[index], AccessMode::Read)?;
            let sub_ids = block::internal_block_ids(guard.data_read(), config);
            drop(guard);
            free_subtree(txn, config, levels - 1, &sub_ids, sub_old_offset, sub_old_size)?;
        }
        txn.free(ids[index])?;
    }

    Ok(())
}

/// Frees every slice the old window touched but the new (smaller) one
/// doesn't, recursing into kept slices to trim their own children first.
fn deallocate_recursively<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    levels: i32,
    ids: &mut [BlockId],
    old_offset: i64,
    old_size: i64,
    new_offset: i64,
    new_size: i64,
) -> Result<()> {
    let (old_lo, old_hi) = refword::compute_acquisition_range(config, levels, old_offset, old_size);
    for i in old_lo..old_hi {
        deallocate_index(txn, config, levels, ids, i as usize, old_offset, old_size, new_offset, new_size)?;
    }
    Ok(())
}

/// Recursively frees every block under `ids` within `[offset, offset+size)`
/// — used when a whole child slice falls outside the new window and its
/// entire subtree needs reclaiming, not just trimming.
fn free_subtree<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    levels: i32,
    ids: &[BlockId],
    offset: i64,
    size: i64,
) -> Result<()> {
    let (lo, hi) = refword::compute_acquisition_range(config, levels, offset, size);
    for i in lo..hi {
        let index = i as usize;
        if levels > 1 {
            let (sub_offset, sub_size) = refword::shrink_local(config, levels, offset, size, i);
            let guard = txn.acquire(ids[index], AccessMode::Read)?;
            let sub_ids = block::internal_block_ids(guard.data_read(), config);
            drop(guard);
            free_subtree(txn, config, levels - 1, &sub_ids, sub_offset, sub_size)?;
        }
        txn.free(ids[index])?;
    }
    Ok(())
}

/// Shrinks the root-level footprint to `[new_offset, new_offset + new_size)`,
/// freeing everything outside it.
pub(crate) fn deallocate_to_dimensions<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    ref_buf: &mut [u8],
    maxreflen: usize,
    levels: i32,
    new_offset: i64,
    new_size: i64,
) -> Result<()> {
    let old_offset = refword::ref_value_offset(ref_buf, maxreflen);
    let old_size = refword::value_size(ref_buf, maxreflen);

    if levels != 0 {
        let mut ids = read_root_ids(ref_buf, maxreflen);
        deallocate_recursively(txn, config, levels, &mut ids, old_offset, old_size, new_offset, new_size)?;
        write_root_ids(ref_buf, maxreflen, &ids);
    }
    Ok(())
}

/// Wraps the current root in a new, single internal block, doubling
/// addressable capacity. The old root's ids move into the new block's
/// slot 0's... no — into the new block itself, referenced from root slot 0.
pub(crate) fn add_level<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    ref_buf: &mut [u8],
    maxreflen: usize,
    levels: i32,
) -> Result<i32> {
    let root_capacity = refword::root_fanout_max(maxreflen) as usize;
    debug_assert!(config.internal_fanout() >= root_capacity);
    let old_ids = read_root_ids(ref_buf, maxreflen);

    let mut guard = txn.allocate()?;
    {
        let data = guard.data_write();
        block::init_internal(data);
        for i in 0..config.internal_fanout() {
            let id = old_ids.get(i).copied().unwrap_or(BlockId::NULL);
            block::set_internal_block_id(data, i, id);
        }
    }
    let new_root_id = guard.block_id();
    drop(guard);

    refword::set_root_block_id(ref_buf, maxreflen, 0, new_root_id);
    for i in 1..root_capacity {
        refword::set_root_block_id(ref_buf, maxreflen, i, BlockId::NULL);
    }
    Ok(levels + 1)
}

/// The inverse of [`add_level`]: if the whole value already fits under the
/// single child addressed by root slot 0, promotes that child's own id
/// array up into the root and frees it. Returns `None` (no-op) if `levels`
/// is already 0 or the value doesn't fit under one fewer level.
pub(crate) fn remove_level<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    ref_buf: &mut [u8],
    maxreflen: usize,
    levels: i32,
) -> Result<Option<i32>> {
    if levels <= 1 {
        return Ok(None);
    }

    let value_offset = refword::ref_value_offset(ref_buf, maxreflen);
    let value_size = refword::value_size(ref_buf, maxreflen);
    let capacity_below = refword::max_end_offset(config, levels - 1, maxreflen);
    if value_offset + value_size > capacity_below {
        return Ok(None);
    }

    let root_id = refword::root_block_id(ref_buf, maxreflen, 0);
    let guard = txn.acquire(root_id, AccessMode::Read)?;
    let child_ids = block::internal_block_ids(guard.data_read(), config);
    drop(guard);
    txn.free(root_id)?;

    let root_capacity = refword::root_fanout_max(maxreflen) as usize;
    for i in 0..root_capacity {
        let id = child_ids.get(i).copied().unwrap_or(BlockId::NULL);
        refword::set_root_block_id(ref_buf, maxreflen, i, id);
    }
    Ok(Some(levels - 1))
}

/// Slides the value's position within the tree so that afterward
/// `ref_value_offset() >= min_shift` more than it was, without changing
/// its size. Used to make room for a prepend without growing past the
/// current level's capacity. The shift is always a multiple of the
/// current level's leaf-block stepsize, so it never splits a leaf.
///
/// Returns `false` (no change made) if `min_shift` can't be satisfied
/// without exceeding `levels`'s addressable range — the caller must
/// [`add_level`] and retry.
pub(crate) fn shift_at_least<T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    ref_buf: &mut [u8],
    maxreflen: usize,
    levels: i32,
    min_shift: i64,
) -> Result<bool> {
    if levels == 0 {
        return Ok(min_shift <= 0);
    }
    if min_shift <= 0 {
        return Ok(true);
    }

    let step = refword::stepsize(config, levels);
    let delta = refword::ceil_divide(min_shift, step) * step;

    let old_offset = refword::ref_value_offset(ref_buf, maxreflen);
    let old_size = refword::value_size(ref_buf, maxreflen);
    let new_offset = old_offset + delta;

    if new_offset < 0 || new_offset + old_size > refword::max_end_offset(config, levels, maxreflen) {
        return Ok(false);
    }

    if old_size > 0 {
        let union_offset = old_offset.min(new_offset);
        let union_end = (old_offset + old_size).max(new_offset + old_size);
        let fits = allocate_to_dimensions(txn, config, ref_buf, maxreflen, levels, union_offset, union_end - union_offset)?;
        debug_assert!(fits, "union of old and new windows must fit once bounds-checked above");

        let ids = read_root_ids(ref_buf, maxreflen);
        let bytes = {
            let region = acquire::expose_large_window(txn, config, AccessMode::Read, levels, ids.clone(), old_offset, old_size)?;
            region.read_to_vec()
        };
        {
            let mut region = acquire::expose_large_window(txn, config, AccessMode::Write, levels, ids.clone(), new_offset, old_size)?;
            region.write_from(&bytes);
        }

        let mut ids = ids;
        deallocate_recursively(
            txn,
            config,
            levels,
            &mut ids,
            union_offset,
            union_end - union_offset,
            new_offset,
            old_size,
        )?;
        write_root_ids(ref_buf, maxreflen, &ids);
    }

    refword::set_big_offset(ref_buf, maxreflen, new_offset);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;
    use crate::handle::BlobHandle;

    fn cfg() -> BlobStoreConfig {
        BlobStoreConfig::new(256, 32).max_concurrent_io_requests(4)
    }

    #[test]
    fn add_level_then_remove_level_round_trips() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let mut handle = BlobHandle::empty(config.maxreflen);
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 211) as u8).collect();
        handle.append(&txn, &config, &payload).unwrap();
        let levels = handle.ref_levels(&config);
        assert!(levels >= 1);

        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, payload.len() as i64).unwrap();
        assert_eq!(region.read_to_vec(), payload);
    }

    #[test]
    fn prepend_then_append_preserves_bytes() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, &[1u8; 20]).unwrap();
        handle.prepend(&txn, &config, &[2u8; 4000]).unwrap();
        handle.append(&txn, &config, &[3u8; 20]).unwrap();

        let total = handle.valuesize();
        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, total).unwrap();
        let bytes = region.read_to_vec();
        assert_eq!(&bytes[..4000], &[2u8; 4000][..]);
        assert_eq!(&bytes[4000..4020], &[1u8; 20][..]);
        assert_eq!(&bytes[4020..4040], &[3u8; 20][..]);
    }

    #[test]
    fn unappend_demotes_a_level_even_when_root_fanout_exceeds_one() {
        // With maxreflen=251 (root_fanout_max=29), the minimal level for
        // 50_000 bytes is 1 (max_end_offset(1) = 4092 * 29 = 118_668), but
        // the physical tree built for 1_000_000 bytes is 2 levels deep. If
        // `remove_level` only checked against one child's `stepsize(1)`
        // rather than the whole level-1 reference's capacity, it would
        // refuse to demote even though the value comfortably fits.
        let config = BlobStoreConfig::new(4096, 251);
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 223) as u8).collect();
        let mut handle = BlobHandle::empty(config.maxreflen);
        handle.append(&txn, &config, &payload).unwrap();
        assert_eq!(handle.ref_levels(&config), 2);

        handle.unappend(&txn, &config, payload.len() as i64 - 50_000).unwrap();
        assert_eq!(handle.valuesize(), 50_000);
        assert_eq!(handle.ref_levels(&config), 1);

        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, 50_000).unwrap();
        assert_eq!(region.read_to_vec(), &payload[..50_000]);
    }

    #[test]
    fn unappend_then_unprepend_shrinks_back_down() {
        let config = cfg();
        let cache = MemCache::open_temporary(&config).unwrap();
        let txn = cache.begin();

        let mut handle = BlobHandle::empty(config.maxreflen);
        let payload: Vec<u8> = (0..6000u32).map(|i| (i % 253) as u8).collect();
        handle.append(&txn, &config, &payload).unwrap();

        handle.unappend(&txn, &config, 1000).unwrap();
        handle.unprepend(&txn, &config, 1000).unwrap();
        assert_eq!(handle.valuesize(), payload.len() as i64 - 2000);

        let region = handle
            .expose_region(&txn, &config, AccessMode::Read, 0, handle.valuesize())
            .unwrap();
        assert_eq!(region.read_to_vec(), payload[1000..payload.len() - 1000]);
    }
}
