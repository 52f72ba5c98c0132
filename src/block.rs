// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk layout of the two node kinds making up a large value's tree:
//! leaf blocks (`larl`) carrying raw value bytes, and internal blocks
//! (`lari`) carrying an array of child [`BlockId`]s.
//!
//! Both kinds share the same 4-byte magic header; the rest of the block
//! is either raw bytes (leaf) or a packed `BlockId` array (internal).

use crate::block_id::BlockId;
use crate::config::BlobStoreConfig;
use byteorder::{ByteOrder, LittleEndian};

pub const MAGIC_LEN: usize = 4;
pub const LEAF_MAGIC: [u8; MAGIC_LEN] = *b"larl";
pub const INTERNAL_MAGIC: [u8; MAGIC_LEN] = *b"lari";

/// Stamps a freshly allocated block as a leaf node.
pub fn init_leaf(data: &mut [u8]) {
    data[..MAGIC_LEN].copy_from_slice(&LEAF_MAGIC);
}

/// Stamps a freshly allocated block as an internal node.
pub fn init_internal(data: &mut [u8]) {
    data[..MAGIC_LEN].copy_from_slice(&INTERNAL_MAGIC);
}

/// Raw value bytes of a leaf block (everything past the magic header).
pub fn leaf_data(block: &[u8]) -> &[u8] {
    debug_assert_eq!(&block[..MAGIC_LEN], &LEAF_MAGIC, "not a leaf block");
    &block[MAGIC_LEN..]
}

pub fn leaf_data_mut(block: &mut [u8]) -> &mut [u8] {
    debug_assert_eq!(&block[..MAGIC_LEN], &LEAF_MAGIC, "not a leaf block");
    &mut block[MAGIC_LEN..]
}

/// Reads the `BlockId` stored at `index` inside an internal block.
pub fn internal_block_id(block: &[u8], index: usize) -> BlockId {
    debug_assert_eq!(&block[..MAGIC_LEN], &INTERNAL_MAGIC, "not an internal block");
    let start = MAGIC_LEN + index * BlockId::SERIALIZED_LEN;
    BlockId(LittleEndian::read_u64(&block[start..start + BlockId::SERIALIZED_LEN]))
}

/// Writes `id` at `index` inside an internal block.
pub fn set_internal_block_id(block: &mut [u8], index: usize, id: BlockId) {
    debug_assert_eq!(&block[..MAGIC_LEN], &INTERNAL_MAGIC, "not an internal block");
    let start = MAGIC_LEN + index * BlockId::SERIALIZED_LEN;
    LittleEndian::write_u64(&mut block[start..start + BlockId::SERIALIZED_LEN], id.0);
}

/// Reads the whole slice of (possibly partially meaningful) child ids
/// of an internal block, as laid out by `config.internal_fanout()`.
pub fn internal_block_ids(block: &[u8], config: &BlobStoreConfig) -> Vec<BlockId> {
    (0..config.internal_fanout())
        .map(|i| internal_block_id(block, i))
        .collect()
}
