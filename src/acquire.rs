// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block acquisition: turns a `[offset, size)` window over a reference word
//! into a [`RegionBuffer`] the caller can read from or write into.
//!
//! Large values walk a multi-level block tree in two passes. Phase one
//! descends in parallel: every child slice a window touches is independent,
//! so each is acquired (and, for internal nodes, recursed into) on its own
//! thread via [`std::thread::scope`]. Phase two walks the resulting tree
//! serially, left to right, turning each leaf into a span of the final
//! buffer — the order callers see spans in matches the order the bytes
//! appear in the value, which the parallel phase alone doesn't guarantee.

use crate::block;
use crate::block_id::BlockId;
use crate::cache::{AccessMode, BlockGuard, Transaction};
use crate::config::BlobStoreConfig;
use crate::error::Result;
use crate::refword;

/// One physically contiguous slice of a large value, backed by a held block.
struct LeafSpan<G> {
    guard: G,
    local_offset: usize,
    local_len: usize,
}

/// The materialized view of a `[offset, size)` window over a blob's value.
///
/// Dropping this releases every block it holds. Nothing here is cloneable:
/// there is exactly one path back to the cache for each acquired block.
pub enum RegionBuffer<'h, G: BlockGuard> {
    /// The whole value lives inline in the reference word; this borrows
    /// straight into it.
    Inline(&'h mut [u8]),
    /// One or more leaf blocks, in value order.
    Tree(Vec<LeafSpan<G>>),
}

impl<'h, G: BlockGuard> RegionBuffer<'h, G> {
    /// Total length in bytes across every span.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Inline(b) => b.len(),
            Self::Tree(spans) => spans.iter().map(|s| s.local_len).sum(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct spans a caller would see if iterating buffer by
    /// buffer, matching the spec's notion of a `buffer_group`.
    #[must_use]
    pub fn span_count(&self) -> usize {
        match self {
            Self::Inline(_) => 1,
            Self::Tree(spans) => spans.len(),
        }
    }

    /// Copies every span's bytes into one contiguous `Vec`.
    #[must_use]
    pub fn read_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        match self {
            Self::Inline(b) => out.extend_from_slice(b),
            Self::Tree(spans) => {
                for span in spans {
                    let data = span.guard.data_read();
                    out.extend_from_slice(&data[span.local_offset..span.local_offset + span.local_len]);
                }
            }
        }
        out
    }

    /// Scatters `src` across the region's spans, in order. `src.len()` must
    /// equal `self.len()`.
    pub fn write_from(&mut self, src: &[u8]) {
        assert_eq!(src.len(), self.len(), "write_from: size mismatch");
        match self {
            Self::Inline(b) => b.copy_from_slice(src),
            Self::Tree(spans) => {
                let mut pos = 0;
                for span in spans {
                    let data = span.guard.data_write();
                    let chunk = &src[pos..pos + span.local_len];
                    data[span.local_offset..span.local_offset + span.local_len].copy_from_slice(chunk);
                    pos += span.local_len;
                }
            }
        }
    }
}

/// The intermediate shape phase one builds and phase two consumes: either a
/// held leaf block or an internal node's already-acquired children.
enum TreeNode<G> {
    Leaf(G),
    Internal(Vec<TreeNode<G>>),
}

/// Exposes `[offset, offset + size)` of the value referenced by `ref_buf`.
///
/// `ref_buf` must be exactly the caller's reference word (`maxreflen`
/// bytes). For an inline value the returned buffer borrows directly into
/// it; for a large value it descends the block tree through `txn`.
pub fn expose_region<'h, T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    ref_buf: &'h mut [u8],
    maxreflen: usize,
    mode: AccessMode,
    offset: i64,
    size: i64,
) -> Result<RegionBuffer<'h, T::Guard>> {
    debug_assert!(offset >= 0 && size >= 0);
    debug_assert!(offset + size <= refword::value_size(ref_buf, maxreflen));

    if size == 0 {
        return Ok(RegionBuffer::Tree(Vec::new()));
    }

    if refword::is_small(ref_buf, maxreflen) {
        let start = refword::size_discriminator_width(maxreflen) + offset as usize;
        let end = start + size as usize;
        return Ok(RegionBuffer::Inline(&mut ref_buf[start..end]));
    }

    let levels = refword::ref_levels(config, ref_buf, maxreflen);
    let absolute_offset = refword::big_offset(ref_buf, maxreflen) + offset;
    let (lo, hi) = refword::compute_acquisition_range(config, levels, absolute_offset, size);
    let root_ids: Vec<BlockId> =
        (lo..hi).map(|i| refword::root_block_id(ref_buf, maxreflen, i as usize)).collect();

    // `root_ids` is compacted to the acquired range `[lo, hi)`, but
    // `make_tree`/`make_tree_node` index by the absolute child index
    // (`lo + i`); rebase back down to the compacted array's own coordinates.
    let tree = make_tree(txn, mode, levels, absolute_offset, size, config, move |i: i64| {
        root_ids[(i - lo) as usize]
    })?;

    let mut spans = Vec::new();
    assemble(levels, absolute_offset, size, tree, config, &mut spans);
    Ok(RegionBuffer::Tree(spans))
}

/// Phase one: acquires (and, below the leaf level, recurses into) every
/// child slice `[offset, offset + size)` touches at `levels`, in parallel.
///
/// `id_at(local_index)` resolves a local child index (`0..hi-lo`, already
/// offset by `lo`) to the block id to acquire; at the root this reads the
/// reference word's own id array, at every other level it reads an already
/// fetched internal block's id array.
fn make_tree<T: Transaction>(
    txn: &T,
    mode: AccessMode,
    levels: i32,
    offset: i64,
    size: i64,
    config: &BlobStoreConfig,
    id_at: impl Fn(i64) -> BlockId + Sync,
) -> Result<Vec<TreeNode<T::Guard>>> {
    let (lo, hi) = refword::compute_acquisition_range(config, levels, offset, size);
    let n = (hi - lo) as usize;

    if n <= 1 {
        return (0..n as i64)
            .map(|i| make_tree_node(txn, mode, levels, offset, size, lo, i, config, &id_at))
            .collect();
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..n as i64)
            .map(|i| {
                let id_at = &id_at;
                scope.spawn(move || make_tree_node(txn, mode, levels, offset, size, lo, i, config, id_at))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("block descent worker panicked"))
            .collect()
    })
}

#[allow(clippy::too_many_arguments)]
fn make_tree_node<T: Transaction>(
    txn: &T,
    mode: AccessMode,
    levels: i32,
    offset: i64,
    size: i64,
    lo: i64,
    i: i64,
    config: &BlobStoreConfig,
    id_at: &(impl Fn(i64) -> BlockId + Sync),
) -> Result<TreeNode<T::Guard>> {
    let index = lo + i;
    let id = id_at(index);
    let guard = txn.acquire(id, mode)?;

    if levels > 1 {
        let child_ids = block::internal_block_ids(guard.data_read(), config);
        drop(guard);
        let (sub_offset, sub_size) = refword::shrink_local(config, levels, offset, size, index);
        let children = make_tree(txn, mode, levels - 1, sub_offset, sub_size, config, move |j: i64| {
            child_ids[j as usize]
        })?;
        Ok(TreeNode::Internal(children))
    } else {
        Ok(TreeNode::Leaf(guard))
    }
}

/// Phase two: walks the tree phase one built, left to right, translating
/// each leaf's already-rebased local offset into a span of the final
/// buffer. Single-threaded — the point is value-order, not throughput.
fn assemble<G: BlockGuard>(
    levels: i32,
    offset: i64,
    size: i64,
    tree: Vec<TreeNode<G>>,
    config: &BlobStoreConfig,
    out: &mut Vec<LeafSpan<G>>,
) {
    let (lo, _hi) = refword::compute_acquisition_range(config, levels, offset, size);
    for (i, node) in tree.into_iter().enumerate() {
        let index = lo + i as i64;
        let (sub_offset, sub_size) = refword::shrink_local(config, levels, offset, size, index);
        match node {
            TreeNode::Internal(children) => {
                assemble(levels - 1, sub_offset, sub_size, children, config, out);
            }
            TreeNode::Leaf(guard) => {
                debug_assert!(sub_size > 0 && sub_size as usize <= config.leaf_size());
                debug_assert!(sub_offset >= 0 && sub_offset as usize + sub_size as usize <= config.leaf_size());
                out.push(LeafSpan {
                    guard,
                    local_offset: sub_offset as usize,
                    local_len: sub_size as usize,
                });
            }
        }
    }
}

/// Exposes `[offset, offset + size)` of a large value given its root ids
/// and level count directly, bypassing reference-word parsing. Used by
/// structural mutation (shifting an existing window to a new position)
/// which already knows `levels` and has its own copy of the root ids.
pub(crate) fn expose_large_window<'h, T: Transaction>(
    txn: &T,
    config: &BlobStoreConfig,
    mode: AccessMode,
    levels: i32,
    root_ids: Vec<BlockId>,
    offset: i64,
    size: i64,
) -> Result<RegionBuffer<'h, T::Guard>> {
    if size == 0 {
        return Ok(RegionBuffer::Tree(Vec::new()));
    }

    let tree = make_tree(txn, mode, levels, offset, size, config, move |i: i64| root_ids[i as usize])?;
    let mut spans = Vec::new();
    assemble(levels, offset, size, tree, config, &mut spans);
    Ok(RegionBuffer::Tree(spans))
}
