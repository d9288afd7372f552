// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Node cache of fixed size.
//!
//! When the share of dirty nodes reaches the high watermark, or dirty
//! nodes get old enough, they are flushed out in the order of the
//! timestamp the node was modified first. When the cache is getting
//! almost full, clean unreferenced nodes are evicted in LRU order.
//! One cache can be shared among multiple tables.

use crate::{
    layout::Layout,
    log::LogMgr,
    tree::node::{now_micros, Node, NodeOps},
    Bid, Options, Status, TableNo, Tree,
};
use rustc_hash::FxHashMap;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

/// Builds empty nodes for the cache's miss path
pub trait NodeFactory: Send + Sync {
    /// Creates an empty node ready to deserialize block `nid`.
    fn new_node(&self, nid: Bid) -> Node;
}

/// Everything the cache needs to serve one table
pub(crate) struct TableSettings {
    pub factory: Arc<dyn NodeFactory>,
    pub layout: Arc<dyn Layout>,
    pub tree: Tree,
    pub last_checkpoint_at: Arc<Mutex<Instant>>,
}

impl Clone for TableSettings {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            layout: self.layout.clone(),
            tree: self.tree.clone(),
            last_checkpoint_at: self.last_checkpoint_at.clone(),
        }
    }
}

type NodeKey = (TableNo, Bid);

/// Shared node cache with dirty write-back
pub struct Cache {
    inner: Arc<CacheInner>,
    flusher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct CacheInner {
    options: Arc<Options>,
    status: Arc<Status>,
    logmgr: Arc<LogMgr>,

    tables: RwLock<FxHashMap<TableNo, TableSettings>>,
    nodes: RwLock<FxHashMap<NodeKey, Arc<Node>>>,

    /// Total byte size of cached nodes; recomputed on every full scan,
    /// an advisory watermark rather than a hard invariant
    size: AtomicUsize,

    /// Serializes whole-table operations (flush, delete) against each
    /// other
    global_mtx: Mutex<()>,

    /// Suppresses checkpointing while the redo log is being replayed
    recovering: AtomicBool,

    /// Cleared on shutdown so the flusher thread winds down
    alive: AtomicBool,
}

impl Cache {
    #[must_use]
    pub fn new(options: Arc<Options>, status: Arc<Status>, logmgr: Arc<LogMgr>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                options,
                status,
                logmgr,
                tables: RwLock::new(FxHashMap::default()),
                nodes: RwLock::new(FxHashMap::default()),
                size: AtomicUsize::new(0),
                global_mtx: Mutex::new(()),
                recovering: AtomicBool::new(false),
                alive: AtomicBool::new(false),
            }),
            flusher: Mutex::new(None),
        }
    }

    /// Starts the background flusher thread.
    pub fn init(&self) -> crate::Result<()> {
        let mut flusher = self.flusher.lock().expect("lock is poisoned");
        debug_assert!(flusher.is_none(), "cache initialized twice");

        self.inner.alive.store(true, SeqCst);

        let inner = self.inner.clone();
        *flusher = Some(
            std::thread::Builder::new()
                .name("cascadb-flusher".to_string())
                .spawn(move || inner.write_back())?,
        );

        Ok(())
    }

    pub(crate) fn set_in_recovering(&self) {
        self.inner.recovering.store(true, SeqCst);
    }

    pub(crate) fn set_out_recovering(&self) {
        self.inner.recovering.store(false, SeqCst);
    }

    /// Registers a table; fails if the table number is taken.
    pub(crate) fn add_table(
        &self,
        tbn: TableNo,
        factory: Arc<dyn NodeFactory>,
        layout: Arc<dyn Layout>,
        tree: Tree,
    ) -> crate::Result<()> {
        let mut tables = self.inner.tables.write().expect("lock is poisoned");

        if tables.contains_key(&tbn) {
            log::error!("table {tbn} already registered in cache");
            return Err(crate::Error::TableConflict(tbn));
        }

        tables.insert(
            tbn,
            TableSettings {
                factory,
                layout,
                tree,
                last_checkpoint_at: Arc::new(Mutex::new(Instant::now())),
            },
        );

        Ok(())
    }

    pub(crate) fn get_table_settings(&self, tbn: TableNo) -> Option<TableSettings> {
        self.inner.get_table_settings(tbn)
    }

    /// Flushes all dirty nodes of a table, reaps its zombies and, unless
    /// recovering, takes a checkpoint pairing the log horizon with the
    /// on-disk node state.
    pub(crate) fn flush_table(&self, tbn: TableNo) -> crate::Result<()> {
        self.inner.flush_table(tbn)
    }

    /// Deregisters a table and destroys all of its cached nodes, by
    /// default flushing them first.
    pub(crate) fn del_table(&self, tbn: TableNo, flush: bool) -> crate::Result<()> {
        if flush {
            self.flush_table(tbn)?;
        }

        let inner = &self.inner;

        {
            let mut tables = inner.tables.write().expect("lock is poisoned");
            if tables.remove(&tbn).is_none() {
                return Ok(());
            }
        }

        let _global = inner.global_mtx.lock().expect("lock is poisoned");

        let mut total_count = 0;
        {
            let mut nodes = inner.nodes.write().expect("lock is poisoned");
            nodes.retain(|&(node_tbn, _), node| {
                if node_tbn != tbn {
                    return true;
                }

                debug_assert_eq!(
                    1,
                    Arc::strong_count(node),
                    "dropping a node still referenced outside the cache",
                );

                inner.sub_size(node.size());
                total_count += 1;
                false
            });
        }

        log::info!("release {total_count} nodes in table {tbn}");
        Ok(())
    }

    /// Inserts a newly created node.
    pub(crate) fn put(&self, tbn: TableNo, nid: Bid, node: Arc<Node>) -> crate::Result<()> {
        let inner = &self.inner;
        Status::bump(&inner.status.cache_put_num);

        debug_assert!(
            inner.get_table_settings(tbn).is_some(),
            "table {tbn} not registered",
        );

        inner.evict_with_retry();

        let mut nodes = inner.nodes.write().expect("lock is poisoned");
        let prev = nodes.insert((tbn, nid), node.clone());
        debug_assert!(prev.is_none(), "node {nid} already cached");

        inner.size.fetch_add(node.size(), SeqCst);
        Ok(())
    }

    /// Acquires a node, loading it through the layout on a miss.
    pub(crate) fn get(
        &self,
        tbn: TableNo,
        nid: Bid,
        skeleton_only: bool,
    ) -> crate::Result<Arc<Node>> {
        let inner = &self.inner;
        Status::bump(&inner.status.cache_get_num);

        {
            let nodes = inner.nodes.read().expect("lock is poisoned");
            if let Some(node) = nodes.get(&(tbn, nid)) {
                Status::bump(&inner.status.node_load_from_mem_num);
                return Ok(node.clone());
            }
        }

        let tbs = inner
            .get_table_settings(tbn)
            .ok_or(crate::Error::TableConflict(tbn))?;

        inner.evict_with_retry();

        let start = Instant::now();
        let block = tbs.layout.read(nid, skeleton_only)?;

        Status::bump(&inner.status.node_load_from_disk_num);
        Status::add(
            &inner.status.node_load_from_disk_us,
            start.elapsed().as_micros() as u64,
        );

        let node = Arc::new(tbs.factory.new_node(nid));
        node.read_from(block.bytes(), skeleton_only)?;

        let mut nodes = inner.nodes.write().expect("lock is poisoned");
        if let Some(existing) = nodes.get(&(tbn, nid)) {
            // two threads raced on the same miss; keep the winner
            log::warn!("detected multiple threads loading node {nid} concurrently");
            return Ok(existing.clone());
        }

        inner.size.fetch_add(node.size(), SeqCst);
        nodes.insert((tbn, nid), node.clone());
        Ok(node)
    }

}

impl Drop for Cache {
    fn drop(&mut self) {
        self.inner.alive.store(false, SeqCst);

        let mut flusher = self.flusher.lock().expect("lock is poisoned");
        if let Some(handle) = flusher.take() {
            let _ = handle.join();
        }

        log::debug!(
            "cache hits: {}, cache misses: {} (cost {}ms), evicts: {}",
            self.inner.status.node_load_from_mem_num(),
            self.inner.status.node_load_from_disk_num(),
            self.inner.status.node_load_from_disk_us() / 1_000,
            self.inner.status.cache_evict_num(),
        );
    }
}

impl CacheInner {
    fn get_table_settings(&self, tbn: TableNo) -> Option<TableSettings> {
        let tables = self.tables.read().expect("lock is poisoned");
        tables.get(&tbn).cloned()
    }

    /// Saturating decrement of the advisory size accumulator; wrapping
    /// below zero would read as a full cache and wedge eviction.
    fn sub_size(&self, bytes: usize) {
        let mut current = self.size.load(SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self
                .size
                .compare_exchange_weak(current, next, SeqCst, SeqCst)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn must_evict(&self) -> bool {
        self.size.load(SeqCst) >= self.options.cache_limit
    }

    fn need_evict(&self) -> bool {
        let threshold = (self.options.cache_limit / 100)
            .saturating_mul(self.options.cache_evict_high_watermark as usize);

        self.size.load(SeqCst) > threshold
    }

    /// Makes room before inserting a node.
    ///
    /// Bounded retry with backoff; after ~10 seconds the cache gives up
    /// and temporarily exceeds its budget, so a put never deadlocks when
    /// everything is pinned by in-flight flushes.
    fn evict_with_retry(&self) {
        if !self.must_evict() {
            return;
        }

        let mut trycnt = 0u64;
        loop {
            self.evict();
            if !self.must_evict() || trycnt > 10_000 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
            trycnt += 1;
        }
    }

    /// Evicts least recently used clean nodes and reaps zombies.
    fn evict(&self) {
        let mut zombies = vec![];
        let mut clean_nodes: Vec<Arc<Node>> = vec![];
        let mut total_size = 0;

        let mut nodes = self.nodes.write().expect("lock is poisoned");

        nodes.retain(|_, node| {
            if node.is_dead() {
                if Arc::strong_count(node) == 1 {
                    zombies.push(node.clone());
                    return false;
                }
                return true;
            }

            total_size += node.size();

            // while the map is write-locked nobody can take a new
            // reference, so an unreferenced clean node stays evictable
            if Arc::strong_count(node) == 1
                && !node.is_dirty()
                && !node.is_flushing()
            {
                clean_nodes.push(node.clone());
            }

            true
        });

        self.size.store(total_size, SeqCst);

        clean_nodes.sort_by_key(|node| node.base().last_used_at_us());

        let goal = (self.options.cache_limit / 100)
            .saturating_mul(self.options.cache_evict_ratio as usize);

        let mut evicted_size = 0;
        for node in &clean_nodes {
            if evicted_size >= goal {
                break;
            }

            if nodes.remove(&(node.tbn(), node.nid())).is_some() {
                Status::bump(&self.status.cache_evict_num);
                evicted_size += node.size();
            }
        }

        self.sub_size(evicted_size);
        drop(nodes);

        if !zombies.is_empty() {
            self.delete_nodes(&zombies);
        }
    }

    /// Flusher thread: write back expired dirty nodes, keep the dirty
    /// share below the watermark, checkpoint periodically, evict.
    fn write_back(&self) {
        while self.alive.load(SeqCst) {
            let now = now_micros();
            let goal = (self.options.cache_limit / 100)
                .saturating_mul(self.options.cache_writeback_ratio as usize);

            let mut total_size = 0;
            let mut dirty_size = 0;
            let mut expired_nodes = vec![];

            {
                let nodes = self.nodes.read().expect("lock is poisoned");
                for node in nodes.values() {
                    if node.is_dead() {
                        continue;
                    }

                    let sz = node.size();
                    total_size += sz;

                    if node.is_dirty() {
                        dirty_size += sz;

                        let age_us = now.saturating_sub(node.base().first_write_at_us());
                        let expired = age_us > self.options.cache_dirty_expire_ms * 1_000;

                        // do not write a node until its last write completed
                        if expired && !node.is_flushing() {
                            expired_nodes.push(node.clone());
                        }
                    }
                }
            }

            self.size.store(total_size, SeqCst);

            expired_nodes.sort_by_key(|node| node.base().first_write_at_us());

            let mut flushed_nodes = vec![];
            let mut flushed_size = 0;

            for node in expired_nodes {
                if flushed_size >= goal {
                    break;
                }

                if node.try_pin_flush() {
                    if node.is_dead() {
                        node.set_flushing(false);
                    } else {
                        flushed_size += node.size();
                        flushed_nodes.push(node);
                    }
                }
            }

            // below the per-turn goal but too much dirty data overall:
            // take more candidates regardless of expiry
            let watermark = (self.options.cache_limit / 100)
                .saturating_mul(self.options.cache_dirty_high_watermark as usize);

            if dirty_size.saturating_sub(flushed_size) >= watermark && flushed_size < goal {
                let mut candidates = vec![];

                {
                    let nodes = self.nodes.read().expect("lock is poisoned");
                    for node in nodes.values() {
                        if node.is_dirty() && !node.is_flushing() && !node.is_dead() {
                            candidates.push(node.clone());
                        }
                    }
                }

                candidates.sort_by_key(|node| node.base().first_write_at_us());

                for node in candidates {
                    if flushed_size >= goal {
                        break;
                    }

                    if node.try_pin_flush() {
                        if node.is_dead() {
                            node.set_flushing(false);
                        } else {
                            flushed_size += node.size();
                            flushed_nodes.push(node);
                        }
                    }
                }
            }

            if !flushed_nodes.is_empty() {
                self.flush_nodes(flushed_nodes);
                self.check_checkpoint();
            }

            if self.need_evict() {
                self.evict();
            } else {
                std::thread::sleep(Duration::from_millis(
                    self.options.cache_writeback_interval_ms,
                ));
            }
        }
    }

    /// Serializes pinned nodes and hands them to their layouts.
    ///
    /// Every node arrives here flagged as flushing; serialization marks
    /// it clean, the completion callback clears the flushing flag.
    fn flush_nodes(&self, nodes: Vec<Arc<Node>>) {
        log::trace!("flush {} nodes", nodes.len());

        for node in nodes {
            let Some(tbs) = self.get_table_settings(node.tbn()) else {
                node.set_flushing(false);
                continue;
            };

            Status::bump(&self.status.cache_writeback_num);

            let estimate = node.estimated_buffer_size();
            let mut block = tbs.layout.create(estimate);

            let skeleton_size = match node.write_to(block.writer()) {
                Ok(size) => size,
                Err(e) => {
                    log::error!("serialize node {} error: {e}", node.nid());
                    node.set_flushing(false);
                    continue;
                }
            };

            let completed = node.clone();
            tbs.layout.async_write(
                node.nid(),
                block,
                skeleton_size,
                Box::new(move |succ| {
                    if succ {
                        log::trace!(
                            "write node table {}, nid {} ok",
                            completed.tbn(),
                            completed.nid(),
                        );
                    } else {
                        log::error!(
                            "write node table {}, nid {} error",
                            completed.tbn(),
                            completed.nid(),
                        );
                        // leave the node dirty so the next writeback
                        // pass retries it
                        completed.set_dirty(true);
                    }

                    completed.set_flushing(false);
                }),
            );
        }
    }

    /// Tells each layout to forget a batch of dead nodes.
    fn delete_nodes(&self, nodes: &[Arc<Node>]) {
        log::trace!("delete {} nodes", nodes.len());

        for node in nodes {
            let Some(tbs) = self.get_table_settings(node.tbn()) else {
                continue;
            };

            tbs.layout.delete_block(node.nid());
        }
    }

    /// Flushes tables whose last checkpoint is old enough.
    fn check_checkpoint(&self) {
        if self.recovering.load(SeqCst) {
            return;
        }

        let period = Duration::from_millis(self.options.checkpoint_period_ms);

        let due: Vec<TableNo> = {
            let tables = self.tables.read().expect("lock is poisoned");
            tables
                .iter()
                .filter(|(_, tbs)| {
                    tbs.last_checkpoint_at
                        .lock()
                        .expect("lock is poisoned")
                        .elapsed()
                        >= period
                })
                .map(|(&tbn, _)| tbn)
                .collect()
        };

        for tbn in due {
            if let Err(e) = self.flush_table(tbn) {
                log::error!("periodic checkpoint of table {tbn} failed: {e}");
            }
        }
    }

    /// Flushes all dirty nodes of one table, then checkpoints it.
    fn flush_table(&self, tbn: TableNo) -> crate::Result<()> {
        let tbs = self
            .get_table_settings(tbn)
            .ok_or(crate::Error::TableConflict(tbn))?;

        {
            let _global = self.global_mtx.lock().expect("lock is poisoned");

            let mut zombies = vec![];
            let mut dirty_nodes = vec![];
            let mut dirty_size = 0;

            {
                let mut nodes = self.nodes.write().expect("lock is poisoned");
                nodes.retain(|&(node_tbn, _), node| {
                    if node_tbn != tbn {
                        return true;
                    }

                    if node.is_dead() {
                        // a zombie may only leave the map once nobody
                        // outside the cache holds it; otherwise it
                        // lingers until the next reap
                        if Arc::strong_count(node) == 1 {
                            zombies.push(node.clone());
                            return false;
                        }
                        return true;
                    }

                    if node.is_dirty() && !node.is_flushing() && node.try_pin_flush() {
                        dirty_size += node.size();
                        dirty_nodes.push(node.clone());
                    }

                    true
                });
            }

            if !dirty_nodes.is_empty() {
                log::info!(
                    "flush table {tbn}, write {} nodes, {dirty_size} bytes total",
                    dirty_nodes.len(),
                );
                self.flush_nodes(dirty_nodes);
            }

            if !zombies.is_empty() {
                log::info!("flush table {tbn}, delete {} nodes", zombies.len());
                self.delete_nodes(&zombies);
            }
        }

        if !self.recovering.load(SeqCst) {
            let lsn = self.logmgr.make_checkpoint_begin();

            tbs.layout.make_checkpoint(lsn)?;
            tbs.layout.flush()?;
            self.logmgr.make_checkpoint_end(lsn);

            *tbs.last_checkpoint_at.lock().expect("lock is poisoned") = Instant::now();
            log::debug!("make checkpoint at table {tbn}, lsn {lsn}");
        }

        Ok(())
    }
}
