// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{parse_log_file_name, LogReader};
use crate::{cache::Cache, store::Directory, Lsn};
use std::{collections::BTreeMap, sync::Arc};

/// Replays all surviving redo logs in log-number order
pub struct LogRecover {
    dir: Option<Arc<dyn Directory>>,
    cache: Arc<Cache>,
    recover_cnt: u64,
}

impl LogRecover {
    #[must_use]
    pub fn new(dir: Option<Arc<dyn Directory>>, cache: Arc<Cache>) -> Self {
        Self {
            dir,
            cache,
            recover_cnt: 0,
        }
    }

    /// Total number of replayed records.
    #[must_use]
    pub fn cnt(&self) -> u64 {
        self.recover_cnt
    }

    /// Replays every record with `lsn >= from_lsn` from all redo logs,
    /// then deletes the files.
    ///
    /// A corrupt log aborts the whole recovery; no file is deleted in
    /// that case.
    pub fn recover(&mut self, from_lsn: Lsn) -> crate::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let mut readers = BTreeMap::new();
        for name in dir.get_files()? {
            let Some(log_num) = parse_log_file_name(&name) else {
                continue;
            };

            let reader = LogReader::open(name.clone(), dir.clone(), self.cache.clone(), from_lsn)
                .inspect_err(|e| log::error!("log reader init error, {name}: {e}"))?;

            readers.insert(log_num, reader);
        }

        for reader in readers.values_mut() {
            reader.recovery()?;
            self.recover_cnt += reader.reads();
        }

        log::info!(
            "all redo-logs recover done, recover counts {}",
            self.recover_cnt,
        );

        // only a fully successful replay may clear the logs
        for (_, reader) in readers {
            reader.close_and_remove()?;
        }

        Ok(())
    }
}
