// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// Monotonic engine counters
///
/// Counters are only ever incremented; readers should treat deltas
/// between two snapshots as the interesting quantity.
#[derive(Debug, Default)]
pub struct Status {
    pub(crate) innernode_split_num: AtomicU64,
    pub(crate) innernode_cascade_num: AtomicU64,
    pub(crate) innernode_created_num: AtomicU64,
    pub(crate) innernode_add_pivot_num: AtomicU64,
    pub(crate) innernode_rm_pivot_num: AtomicU64,

    pub(crate) leaf_split_num: AtomicU64,
    pub(crate) leaf_merge_num: AtomicU64,
    pub(crate) leaf_cascade_num: AtomicU64,
    pub(crate) leaf_created_num: AtomicU64,

    pub(crate) cache_put_num: AtomicU64,
    pub(crate) cache_get_num: AtomicU64,
    pub(crate) cache_evict_num: AtomicU64,
    pub(crate) cache_writeback_num: AtomicU64,

    pub(crate) block_read_num: AtomicU64,
    pub(crate) subblock_read_num: AtomicU64,

    pub(crate) async_write_num: AtomicU64,
    pub(crate) async_write_byte: AtomicU64,

    pub(crate) tree_pileup_num: AtomicU64,
    pub(crate) tree_collapse_num: AtomicU64,

    pub(crate) node_load_from_disk_num: AtomicU64,
    pub(crate) node_load_from_disk_us: AtomicU64,
    pub(crate) node_load_from_mem_num: AtomicU64,
}

impl Status {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Relaxed);
    }

    /// Number of inner node splits.
    pub fn innernode_split_num(&self) -> u64 {
        self.innernode_split_num.load(Relaxed)
    }

    /// Number of inner node cascades.
    pub fn innernode_cascade_num(&self) -> u64 {
        self.innernode_cascade_num.load(Relaxed)
    }

    /// Number of inner nodes created.
    pub fn innernode_created_num(&self) -> u64 {
        self.innernode_created_num.load(Relaxed)
    }

    /// Number of pivots added to inner nodes.
    pub fn innernode_add_pivot_num(&self) -> u64 {
        self.innernode_add_pivot_num.load(Relaxed)
    }

    /// Number of pivots removed from inner nodes.
    pub fn innernode_rm_pivot_num(&self) -> u64 {
        self.innernode_rm_pivot_num.load(Relaxed)
    }

    /// Number of leaf splits.
    pub fn leaf_split_num(&self) -> u64 {
        self.leaf_split_num.load(Relaxed)
    }

    /// Number of leaves merged away after being emptied.
    pub fn leaf_merge_num(&self) -> u64 {
        self.leaf_merge_num.load(Relaxed)
    }

    /// Number of message buffers cascaded into leaves.
    pub fn leaf_cascade_num(&self) -> u64 {
        self.leaf_cascade_num.load(Relaxed)
    }

    /// Number of leaves created.
    pub fn leaf_created_num(&self) -> u64 {
        self.leaf_created_num.load(Relaxed)
    }

    /// Number of nodes inserted into the cache.
    pub fn cache_put_num(&self) -> u64 {
        self.cache_put_num.load(Relaxed)
    }

    /// Number of node lookups through the cache.
    pub fn cache_get_num(&self) -> u64 {
        self.cache_get_num.load(Relaxed)
    }

    /// Number of nodes evicted from the cache.
    pub fn cache_evict_num(&self) -> u64 {
        self.cache_evict_num.load(Relaxed)
    }

    /// Number of nodes written back by the flusher.
    pub fn cache_writeback_num(&self) -> u64 {
        self.cache_writeback_num.load(Relaxed)
    }

    /// Number of full block reads.
    pub fn block_read_num(&self) -> u64 {
        self.block_read_num.load(Relaxed)
    }

    /// Number of partial (skeleton) block reads.
    pub fn subblock_read_num(&self) -> u64 {
        self.subblock_read_num.load(Relaxed)
    }

    /// Number of asynchronous block writes issued.
    pub fn async_write_num(&self) -> u64 {
        self.async_write_num.load(Relaxed)
    }

    /// Bytes of asynchronous block writes issued.
    pub fn async_write_byte(&self) -> u64 {
        self.async_write_byte.load(Relaxed)
    }

    /// Number of times the tree grew a new root.
    pub fn tree_pileup_num(&self) -> u64 {
        self.tree_pileup_num.load(Relaxed)
    }

    /// Number of times a depleted root was collapsed.
    pub fn tree_collapse_num(&self) -> u64 {
        self.tree_collapse_num.load(Relaxed)
    }

    /// Number of nodes loaded from disk (cache misses).
    pub fn node_load_from_disk_num(&self) -> u64 {
        self.node_load_from_disk_num.load(Relaxed)
    }

    /// Time spent loading nodes from disk, in microseconds.
    pub fn node_load_from_disk_us(&self) -> u64 {
        self.node_load_from_disk_us.load(Relaxed)
    }

    /// Number of nodes served from memory (cache hits).
    pub fn node_load_from_mem_num(&self) -> u64 {
        self.node_load_from_mem_num.load(Relaxed)
    }
}
