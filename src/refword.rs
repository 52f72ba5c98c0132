// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Pure arithmetic over the reference word: inline/large discrimination,
//! per-level stepsize, acquisition ranges, and reference byte length.
//!
//! Nothing here touches the buffer cache or performs I/O; every function
//! is total over its documented domain.

use crate::block_id::BlockId;
use crate::config::BlobStoreConfig;
use byteorder::{ByteOrder, LittleEndian};

/// Width, in bytes, of the size discriminator at the front of the reference
/// word. 1 byte for `maxreflen <= 255`, else 2.
#[must_use]
pub fn size_discriminator_width(maxreflen: usize) -> usize {
    if maxreflen <= 255 {
        1
    } else {
        2
    }
}

fn big_offset_offset(maxreflen: usize) -> usize {
    size_discriminator_width(maxreflen) + 8
}

/// Byte offset at which the packed root `BlockId` array begins.
#[must_use]
pub fn block_ids_offset(maxreflen: usize) -> usize {
    big_offset_offset(maxreflen) + 8
}

pub(crate) fn ceil_divide(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

fn clamp(x: i64, lo: i64, hi: i64) -> i64 {
    x.clamp(lo, hi)
}

// --- size discriminator -----------------------------------------------

#[must_use]
pub fn small_size(ref_: &[u8], maxreflen: usize) -> usize {
    if maxreflen <= 255 {
        ref_[0] as usize
    } else {
        LittleEndian::read_u16(&ref_[0..2]) as usize
    }
}

pub fn set_small_size(ref_: &mut [u8], size: usize, maxreflen: usize) {
    debug_assert!(size_would_be_small(size, maxreflen));
    if maxreflen <= 255 {
        ref_[0] = size as u8;
    } else {
        LittleEndian::write_u16(&mut ref_[0..2], size as u16);
    }
}

/// Whether `proposed_size` bytes of value still fit inline.
#[must_use]
pub fn size_would_be_small(proposed_size: usize, maxreflen: usize) -> bool {
    proposed_size <= maxreflen - size_discriminator_width(maxreflen)
}

#[must_use]
pub fn is_small(ref_: &[u8], maxreflen: usize) -> bool {
    small_size(ref_, maxreflen) < maxreflen
}

/// Flips the discriminator to read as large, bypassing [`set_small_size`]'s
/// inline-fit assertion (the one caller that legitimately wants the
/// out-of-range sentinel value, during a small -> large transition).
pub fn mark_large(ref_: &mut [u8], maxreflen: usize) {
    if maxreflen <= 255 {
        ref_[0] = maxreflen as u8;
    } else {
        LittleEndian::write_u16(&mut ref_[0..2], maxreflen as u16);
    }
}

/// The inline value bytes (exactly `small_size` of them).
#[must_use]
pub fn small_buffer(ref_: &[u8], maxreflen: usize) -> &[u8] {
    let start = size_discriminator_width(maxreflen);
    &ref_[start..start + small_size(ref_, maxreflen)]
}

pub fn small_buffer_mut(ref_: &mut [u8], maxreflen: usize) -> &mut [u8] {
    let start = size_discriminator_width(maxreflen);
    let n = small_size(ref_, maxreflen);
    &mut ref_[start..start + n]
}

// --- large reference fields --------------------------------------------

#[must_use]
pub fn big_size(ref_: &[u8], maxreflen: usize) -> i64 {
    let off = size_discriminator_width(maxreflen);
    LittleEndian::read_i64(&ref_[off..off + 8])
}

pub fn set_big_size(ref_: &mut [u8], maxreflen: usize, value: i64) {
    let off = size_discriminator_width(maxreflen);
    LittleEndian::write_i64(&mut ref_[off..off + 8], value);
}

#[must_use]
pub fn big_offset(ref_: &[u8], maxreflen: usize) -> i64 {
    let off = big_offset_offset(maxreflen);
    LittleEndian::read_i64(&ref_[off..off + 8])
}

pub fn set_big_offset(ref_: &mut [u8], maxreflen: usize, value: i64) {
    let off = big_offset_offset(maxreflen);
    LittleEndian::write_i64(&mut ref_[off..off + 8], value);
}

#[must_use]
pub fn root_block_id(ref_: &[u8], maxreflen: usize, index: usize) -> BlockId {
    let start = block_ids_offset(maxreflen) + index * BlockId::SERIALIZED_LEN;
    BlockId(LittleEndian::read_u64(&ref_[start..start + BlockId::SERIALIZED_LEN]))
}

pub fn set_root_block_id(ref_: &mut [u8], maxreflen: usize, index: usize, id: BlockId) {
    let start = block_ids_offset(maxreflen) + index * BlockId::SERIALIZED_LEN;
    LittleEndian::write_u64(&mut ref_[start..start + BlockId::SERIALIZED_LEN], id.0);
}

/// Upper bound on the number of root block ids a reference word can hold.
#[must_use]
pub fn root_fanout_max(maxreflen: usize) -> i64 {
    (maxreflen - block_ids_offset(maxreflen)) as i64 / BlockId::SERIALIZED_LEN as i64
}

/// The absolute offset at which the logical value begins, 0 for inline refs.
#[must_use]
pub fn ref_value_offset(ref_: &[u8], maxreflen: usize) -> i64 {
    if is_small(ref_, maxreflen) {
        0
    } else {
        big_offset(ref_, maxreflen)
    }
}

// --- level / stepsize arithmetic ----------------------------------------

/// Bytes of logical value one slot at this level's root (or one leaf, for
/// `levels == 1`) covers.
#[must_use]
pub fn stepsize(config: &BlobStoreConfig, levels: i32) -> i64 {
    debug_assert!(levels > 0);
    let mut step = config.leaf_size() as i64;
    for _ in 0..levels - 1 {
        step *= config.internal_fanout() as i64;
    }
    step
}

/// Largest absolute end offset representable by a reference with this many
/// levels (0 = inline).
#[must_use]
pub fn max_end_offset(config: &BlobStoreConfig, levels: i32, maxreflen: usize) -> i64 {
    if levels == 0 {
        (maxreflen - size_discriminator_width(maxreflen)) as i64
    } else {
        stepsize(config, levels) * root_fanout_max(maxreflen)
    }
}

/// Computes the minimal `(ref_bytes, levels)` needed to represent a large
/// value spanning `[offset, offset + size)`, raising `levels` until the
/// required root block-id count fits in `root_fanout_max`.
#[must_use]
pub fn big_ref_info(
    config: &BlobStoreConfig,
    offset: i64,
    size: i64,
    maxreflen: usize,
) -> (usize, i32) {
    debug_assert!(size > (maxreflen - size_discriminator_width(maxreflen)) as i64);

    let max_blockid_count = root_fanout_max(maxreflen);
    let mut block_count = ceil_divide(size + offset, config.leaf_size() as i64);

    let mut levels = 1;
    while block_count > max_blockid_count {
        block_count = ceil_divide(block_count, config.internal_fanout() as i64);
        levels += 1;
    }

    (
        block_ids_offset(maxreflen) + BlockId::SERIALIZED_LEN * block_count as usize,
        levels,
    )
}

/// `(ref_bytes, levels)` for whatever the reference currently encodes.
#[must_use]
pub fn ref_info(config: &BlobStoreConfig, ref_: &[u8], maxreflen: usize) -> (usize, i32) {
    let smallsize = small_size(ref_, maxreflen);
    if smallsize <= maxreflen - size_discriminator_width(maxreflen) {
        (size_discriminator_width(maxreflen) + smallsize, 0)
    } else {
        big_ref_info(config, big_offset(ref_, maxreflen), big_size(ref_, maxreflen), maxreflen)
    }
}

/// Number of used bytes starting at the reference pointer.
#[must_use]
pub fn ref_size(config: &BlobStoreConfig, ref_: &[u8], maxreflen: usize) -> usize {
    ref_info(config, ref_, maxreflen).0
}

/// The tree level encoded by `ref_` (0 = inline).
#[must_use]
pub fn ref_levels(config: &BlobStoreConfig, ref_: &[u8], maxreflen: usize) -> i32 {
    ref_info(config, ref_, maxreflen).1
}

/// Clamps the global window `[offset, offset + size)` to child `index`'s
/// slice `[index * step, (index + 1) * step)`, in absolute coordinates.
#[must_use]
pub fn shrink(
    config: &BlobStoreConfig,
    levels: i32,
    offset: i64,
    size: i64,
    index: i64,
) -> (i64, i64) {
    let step = stepsize(config, levels);
    let clamp_low = index * step;
    let clamp_high = clamp_low + step;

    let suboffset = clamp(offset, clamp_low, clamp_high);
    let subsize = clamp(offset + size, clamp_low, clamp_high) - suboffset;

    (suboffset, subsize)
}

/// `[lo, hi)` range of child indices a window `[offset, offset + size)`
/// intersects at a given level.
#[must_use]
pub fn compute_acquisition_range(
    config: &BlobStoreConfig,
    levels: i32,
    offset: i64,
    size: i64,
) -> (i64, i64) {
    let step = stepsize(config, levels);
    (offset / step, ceil_divide(offset + size, step))
}

/// Like [`shrink`], but rebases the result to be relative to child `index`'s
/// own coverage start, i.e. into `[0, stepsize(levels))`.
///
/// Threading a window through more than one level of descent has to use
/// this rebased form, not the raw absolute clamp `shrink` returns: an
/// internal block's own child-id array only has `internal_fanout` slots
/// addressed `0..fanout`, and the absolute index of a non-leftmost child is
/// `parent_index * fanout`-scaled, well outside that range. Rebasing at
/// every step keeps both the recursive descent's array indexing and a
/// leaf's final intra-block offset correct.
#[must_use]
pub fn shrink_local(
    config: &BlobStoreConfig,
    levels: i32,
    offset: i64,
    size: i64,
    index: i64,
) -> (i64, i64) {
    let (sub_offset, sub_size) = shrink(config, levels, offset, size, index);
    let step = stepsize(config, levels);
    (sub_offset - index * step, sub_size)
}

/// Total logical byte length of the value (0 for an empty inline blob).
#[must_use]
pub fn value_size(ref_: &[u8], maxreflen: usize) -> i64 {
    if is_small(ref_, maxreflen) {
        small_size(ref_, maxreflen) as i64
    } else {
        big_size(ref_, maxreflen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BlobStoreConfig {
        BlobStoreConfig::new(4096, 251)
    }

    #[test]
    fn inline_size_roundtrip() {
        let mut r = vec![0u8; 251];
        set_small_size(&mut r, 100, 251);
        assert!(is_small(&r, 251));
        assert_eq!(small_size(&r, 251), 100);
    }

    #[test]
    fn large_threshold() {
        // maxreflen=251 -> discriminator width 1, so max inline size is 250.
        assert!(size_would_be_small(250, 251));
        assert!(!size_would_be_small(251, 251));
    }

    #[test]
    fn root_fanout_max_matches_spec_example() {
        // block_size=4096 (leaf_size=4092), maxreflen=251 -> (251-17)/8 = 29
        assert_eq!(root_fanout_max(251), 29);
    }

    #[test]
    fn stepsize_level_one_is_leaf_size() {
        let config = cfg();
        assert_eq!(stepsize(&config, 1), config.leaf_size() as i64);
    }

    #[test]
    fn big_ref_info_picks_minimal_levels() {
        let config = cfg();
        let (bytes, levels) = big_ref_info(&config, 0, 118_668, 251);
        assert_eq!(levels, 1);
        assert!(bytes <= 251);

        let (_, levels2) = big_ref_info(&config, 0, 118_669, 251);
        assert_eq!(levels2, 2);
    }

    #[test]
    fn shrink_clamps_to_child_slice() {
        let config = cfg();
        let step = stepsize(&config, 1);
        let (sub_off, sub_size) = shrink(&config, 1, 0, step + 10, 0);
        assert_eq!(sub_off, 0);
        assert_eq!(sub_size, step);
    }

    #[test]
    fn acquisition_range_covers_whole_window() {
        let config = cfg();
        let step = stepsize(&config, 1);
        let (lo, hi) = compute_acquisition_range(&config, 1, step - 1, 2);
        assert_eq!(lo, 0);
        assert_eq!(hi, 2);
    }
}
