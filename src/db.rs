// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::Cache,
    layout::{BlockLayout, Layout},
    log::{LogMgr, LogRecover},
    store::{Directory, FsDirectory},
    Options, Slice, Status, TableNo, Tree,
};
use std::{path::Path, sync::Arc};

const DAT_FILE_SUFFIX: &str = "cdb";

/// An embedded, write-optimized key/value store
///
/// Wires the tree, the node cache and the redo log together: every
/// write is logged before it enters the tree, the cache writes dirty
/// nodes back in the background, and checkpoints reconcile the two so
/// recovery only replays the log tail.
///
/// # Examples
///
/// ```
/// use cascadb::{Database, Options};
/// #
/// # let folder = tempfile::tempdir()?;
///
/// let db = Database::open(&folder, Options::default())?;
///
/// db.put("my_key", "my_value")?;
/// assert_eq!(Some("my_value".as_bytes().into()), db.get("my_key")?);
///
/// db.del("my_key")?;
/// assert_eq!(None, db.get("my_key")?);
/// #
/// # Ok::<(), cascadb::Error>(())
/// ```
pub struct Database {
    // declaration order is drop order: the tree detaches first, the
    // cache joins its flusher while the log manager and layout are
    // still alive, then the crons stop and redo logs are removed
    tree: Tree,
    cache: Arc<Cache>,
    logmgr: Arc<LogMgr>,
    #[allow(dead_code)]
    layout: Arc<BlockLayout>,

    status: Arc<Status>,
    tbn: TableNo,
    recovered_records: u64,
}

impl Database {
    /// Opens (or creates) a database named `cascadb` in a file system
    /// folder.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> crate::Result<Self> {
        let dir: Arc<dyn Directory> = Arc::new(FsDirectory::open(path)?);
        Self::open_with("cascadb", dir.clone(), Some(dir), options)
    }

    /// Opens (or creates) a database on explicit directories.
    ///
    /// The data file is `<name>.cdb` inside `dir`; redo logs live in
    /// `log_dir`. Without a log directory writes are not logged and a
    /// crash loses everything since the last checkpoint.
    pub fn open_with(
        name: &str,
        dir: Arc<dyn Directory>,
        log_dir: Option<Arc<dyn Directory>>,
        options: Options,
    ) -> crate::Result<Self> {
        let options = Arc::new(options);
        let status = Arc::new(Status::default());
        let tbn = 0;

        let filename = format!("{name}.{DAT_FILE_SUFFIX}");
        let length = dir.file_length(&filename);
        let create = length == 0;
        log::info!("init db, data file length {length}, create {create}");

        let file = dir.open_random_access_file(&filename)?;
        let layout = Arc::new(BlockLayout::new(file, &options, status.clone()));
        layout.init(create)?;

        let logmgr = Arc::new(LogMgr::new(options.clone(), log_dir.clone()));
        LogMgr::init(&logmgr)?;

        let cache = Arc::new(Cache::new(options.clone(), status.clone(), logmgr.clone()));
        cache.init()?;

        let tree = Tree::open(
            tbn,
            options,
            status.clone(),
            cache.clone(),
            layout.clone() as Arc<dyn Layout>,
        )?;

        // replay the log tail into the freshly opened tree; checkpoints
        // are suppressed so a crash mid-recovery can replay again
        cache.set_in_recovering();
        let mut recover = LogRecover::new(log_dir, cache.clone());
        recover.recover(layout.checkpoint_lsn())?;
        let recovered_records = recover.cnt();
        cache.set_out_recovering();

        Ok(Self {
            tree,
            cache,
            logmgr,
            layout,
            status,
            tbn,
            recovered_records,
        })
    }

    /// Stores a key/value pair.
    ///
    /// The write is appended to the redo log, buffered in the tree and
    /// returns immediately; durability follows asynchronously with the
    /// log fsync cron.
    pub fn put<K: Into<Slice>, V: Into<Slice>>(&self, key: K, value: V) -> crate::Result<()> {
        let key = key.into();
        let value = value.into();

        self.logmgr.enq_put(&key, &value, self.tbn, false);
        self.tree.put(key, value)
    }

    /// Removes a key.
    pub fn del<K: Into<Slice>>(&self, key: K) -> crate::Result<()> {
        let key = key.into();

        self.logmgr.enq_del(&key, self.tbn, false);
        self.tree.del(key)
    }

    /// Point lookup.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<Slice>> {
        self.tree.get(key)
    }

    /// Flushes all dirty nodes and takes a checkpoint.
    pub fn flush(&self) -> crate::Result<()> {
        self.cache.flush_table(self.tbn)
    }

    /// Engine counters.
    #[must_use]
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Number of redo log records replayed when this handle was opened.
    #[must_use]
    pub fn recovered_records(&self) -> u64 {
        self.recovered_records
    }

    /// Current tree depth (2 for an empty tree).
    #[must_use]
    pub fn tree_depth(&self) -> u32 {
        self.tree.depth()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.tree.close() {
            log::error!("closing tree failed: {e}");
        }
    }
}
