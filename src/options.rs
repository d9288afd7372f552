// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{comparator::LexicalComparator, Comparator, CompressionType};
use std::sync::Arc;

/// Engine tunables
///
/// The defaults are geared towards large trees on spinning or flash
/// storage; the two `*_count` hooks exist so tests can force structural
/// modifications with a handful of tiny keys.
#[derive(Clone)]
pub struct Options {
    /// Key comparator
    pub comparator: Arc<dyn Comparator>,

    /// Page size of inner nodes.
    ///
    /// Bigger inner nodes improve write performance but degrade
    /// read performance.
    ///
    /// Defaults to 4 MiB.
    pub inner_node_page_size: usize,

    /// Maximum children number of an inner node.
    ///
    /// Bigger fanout decreases the number of inner nodes
    /// but degrades write performance.
    ///
    /// Defaults to 16.
    pub inner_node_children_number: usize,

    /// Maximum count of buffered messages in an inner node.
    ///
    /// Unlimited by default; meant for writing test cases.
    pub inner_node_msg_count: usize,

    /// Page size of leaf nodes.
    ///
    /// Smaller leaves improve read performance but increase
    /// the number of inner nodes.
    ///
    /// Defaults to 4 MiB.
    pub leaf_node_page_size: usize,

    /// Bucket size inside a leaf node, the unit of disk read for
    /// point queries.
    ///
    /// Defaults to 128 KiB.
    pub leaf_node_bucket_size: usize,

    /// Maximum count of records in a leaf node.
    ///
    /// Unlimited by default; meant for writing test cases.
    pub leaf_node_record_count: usize,

    /// Maximum data size of cached nodes in bytes.
    ///
    /// Best set to roughly twice the total size of inner nodes.
    ///
    /// Defaults to 512 MiB.
    pub cache_limit: usize,

    /// Dirty percentage above which writeback kicks in regardless
    /// of expiry (percent).
    ///
    /// Defaults to 30.
    pub cache_dirty_high_watermark: u64,

    /// Age after which a dirty node is written back, in milliseconds.
    ///
    /// Defaults to 30 000.
    pub cache_dirty_expire_ms: u64,

    /// Share of `cache_limit` written back per flusher turn (percent).
    ///
    /// Defaults to 1.
    pub cache_writeback_ratio: u64,

    /// How often the flusher thread wakes up, in milliseconds.
    ///
    /// Defaults to 100.
    pub cache_writeback_interval_ms: u64,

    /// Share of `cache_limit` evicted per eviction turn (percent).
    ///
    /// Defaults to 1.
    pub cache_evict_ratio: u64,

    /// Cache usage above which eviction starts (percent).
    ///
    /// Defaults to 95.
    pub cache_evict_high_watermark: u64,

    /// Compression applied to node blocks.
    pub compress: CompressionType,

    /// Whether CRCs are verified when nodes are read back.
    pub check_crc: bool,

    /// Redo log buffer size in bytes.
    ///
    /// Defaults to 16 MiB.
    pub log_bufsize_byte: usize,

    /// Redo log file size in bytes; an oversize log is rolled.
    ///
    /// Defaults to 256 MiB.
    pub log_filesize_byte: u64,

    /// How often buffered log records are written out, in milliseconds.
    ///
    /// Defaults to 1 000.
    pub log_flush_period_ms: u64,

    /// How often written log records are fsynced, in milliseconds.
    ///
    /// Defaults to 1 000.
    pub log_fsync_period_ms: u64,

    /// How often obsolete log files are deleted, in milliseconds.
    ///
    /// Defaults to 10 000.
    pub log_clean_period_ms: u64,

    /// How often a checkpoint is made per table, in milliseconds.
    ///
    /// Defaults to 60 000.
    pub checkpoint_period_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(LexicalComparator),

            inner_node_page_size: /* 4 MiB */ 4 * 1_024 * 1_024,
            inner_node_children_number: 16,
            inner_node_msg_count: usize::MAX,
            leaf_node_page_size: /* 4 MiB */ 4 * 1_024 * 1_024,
            leaf_node_bucket_size: /* 128 KiB */ 128 * 1_024,
            leaf_node_record_count: usize::MAX,

            cache_limit: /* 512 MiB */ 512 * 1_024 * 1_024,
            cache_dirty_high_watermark: 30,
            cache_dirty_expire_ms: 30_000,
            cache_writeback_ratio: 1,
            cache_writeback_interval_ms: 100,
            cache_evict_ratio: 1,
            cache_evict_high_watermark: 95,

            compress: CompressionType::None,
            check_crc: false,

            log_bufsize_byte: /* 16 MiB */ 16 * 1_024 * 1_024,
            log_filesize_byte: /* 256 MiB */ 256 * 1_024 * 1_024,
            log_flush_period_ms: 1_000,
            log_fsync_period_ms: 1_000,
            log_clean_period_ms: 10_000,

            checkpoint_period_ms: 60_000,
        }
    }
}

impl Options {
    /// Sets the key comparator.
    #[must_use]
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Sets the compression method for node blocks.
    #[must_use]
    pub fn compression(mut self, compress: CompressionType) -> Self {
        self.compress = compress;
        self
    }

    /// Sets the cache memory budget in bytes.
    #[must_use]
    pub fn cache_limit(mut self, bytes: usize) -> Self {
        self.cache_limit = bytes;
        self
    }

    /// Enables or disables CRC verification of node blocks on read.
    #[must_use]
    pub fn check_crc(mut self, check: bool) -> Self {
        self.check_crc = check;
        self
    }
}
