// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{LOG_ENTRY_MIN_SIZE, LOG_HEADER_SIZE};
use crate::{
    cache::Cache,
    checksum::Checksum,
    coding::decode_slice,
    store::{Directory, SequenceFileReader},
    tree::msg::MsgOp,
    Lsn,
};
use byteorder::{BigEndian, ReadBytesExt};
use std::{io::Cursor, sync::Arc, time::Instant};

/// Replays one surviving redo log file into the registered trees
///
/// Corruption is fatal for the file: a bad header or record CRC aborts
/// replay instead of silently skipping records.
pub(crate) struct LogReader {
    filename: String,
    dir: Arc<dyn Directory>,
    cache: Arc<Cache>,

    file: Box<dyn SequenceFileReader>,
    file_size: u64,

    /// Records below this LSN are covered by a checkpoint already
    last_checkpoint_lsn: Lsn,

    log_init_lsn: Lsn,
    reads: u64,
}

impl LogReader {
    pub fn open(
        filename: String,
        dir: Arc<dyn Directory>,
        cache: Arc<Cache>,
        min_checkpoint_lsn: Lsn,
    ) -> crate::Result<Self> {
        let file = dir.open_sequence_file_reader(&filename)?;
        let file_size = dir.file_length(&filename);

        Ok(Self {
            filename,
            dir,
            cache,
            file,
            file_size,
            last_checkpoint_lsn: min_checkpoint_lsn,
            log_init_lsn: 0,
            reads: 0,
        })
    }

    /// Number of replayed records.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads
    }

    fn read_header(&mut self) -> crate::Result<()> {
        let mut header = vec![0; LOG_HEADER_SIZE as usize];
        self.file.read(&mut header)?;

        let mut reader = Cursor::new(&header);
        self.log_init_lsn = reader.read_u64::<BigEndian>()?;
        let expected = Checksum::from_raw(reader.read_u32::<BigEndian>()?);

        Checksum::of(header.get(..8).unwrap_or_default())
            .check(expected)
            .map_err(|_| {
                log::error!(
                    "log header crc error, {}, length {}",
                    self.filename,
                    self.file_size,
                );
                crate::Error::LogCorrupt("log header crc mismatch")
            })?;

        Ok(())
    }

    /// Scans the file from the checkpoint horizon forward and applies
    /// every surviving record through the cache's table registry.
    pub fn recovery(&mut self) -> crate::Result<()> {
        // nothing but (at most) a header: nothing to replay
        if self.file_size <= LOG_HEADER_SIZE {
            return Ok(());
        }

        self.read_header()?;

        // the whole log predates the checkpoint
        if self.last_checkpoint_lsn >= self.log_init_lsn + self.file_size {
            log::warn!(
                "this log is outdated, log init lsn {}, file size {}, last checkpoint lsn {}",
                self.log_init_lsn,
                self.file_size,
                self.last_checkpoint_lsn,
            );
            return Ok(());
        }

        let mut location = if self.last_checkpoint_lsn < self.log_init_lsn {
            LOG_HEADER_SIZE
        } else {
            (self.last_checkpoint_lsn - self.log_init_lsn).max(LOG_HEADER_SIZE)
        };

        self.file.seek(location)?;

        let start = Instant::now();
        log::info!(
            "recover start {}, log init lsn {}, last checkpoint lsn {}, log size {}, start location {location}",
            self.filename,
            self.log_init_lsn,
            self.last_checkpoint_lsn,
            self.file_size,
        );

        while location < self.file_size {
            let mut len_buf = [0u8; 4];
            self.file.read(&mut len_buf)?;
            let entry_size = u32::from_be_bytes(len_buf);

            if entry_size < LOG_ENTRY_MIN_SIZE {
                log::error!("log entry size {entry_size} too small, offset {location}");
                return Err(crate::Error::LogCorrupt("undersized log entry"));
            }

            // the rest of the record, past the leading length
            let mut entry = vec![0; entry_size as usize - 4];
            self.file.read(&mut entry)?;

            let crc_payload_len = entry.len() - 8;
            let expected = Checksum::from_raw(u32::from_be_bytes(
                entry
                    .get(crc_payload_len..crc_payload_len + 4)
                    .and_then(|b| b.try_into().ok())
                    .unwrap_or_default(),
            ));

            let actual = Checksum::of(entry.get(..crc_payload_len).unwrap_or_default());
            if actual.check(expected).is_err() {
                log::error!(
                    "log entry crc error, {}, offset {location}, reads {}, entry size {entry_size}",
                    self.filename,
                    self.reads,
                );
                return Err(crate::Error::LogCorrupt("log entry crc mismatch"));
            }

            self.replay_entry(&entry, location)?;

            location += u64::from(entry_size);
            self.reads += 1;
        }

        log::info!(
            "recover end {}, recover count {}, cost {:?}",
            self.filename,
            self.reads,
            start.elapsed(),
        );

        Ok(())
    }

    fn replay_entry(&self, entry: &[u8], location: u64) -> crate::Result<()> {
        let mut reader = Cursor::new(entry);

        let lsn = reader.read_u64::<BigEndian>()?;
        let tbn = reader.read_u32::<BigEndian>()?;
        let op_tag = reader.read_u8()?;

        let op = MsgOp::try_from(op_tag).map_err(|()| {
            log::error!(
                "unknown log entry type {op_tag}, {}, offset {location}",
                self.filename,
            );
            crate::Error::LogCorrupt("unknown log entry type")
        })?;

        let key = decode_slice(&mut reader)?;
        let value = decode_slice(&mut reader)?;

        // the table may have been dropped since the record was written
        let Some(tbs) = self.cache.get_table_settings(tbn) else {
            log::error!(
                "get table error, {}, file_size {}, tbn {tbn}",
                self.filename,
                self.file_size,
            );
            return Ok(());
        };

        // a crash can land between per-table checkpoints; records this
        // table already has on disk are skipped
        if tbs.layout.checkpoint_lsn() > lsn {
            return Ok(());
        }

        match op {
            MsgOp::Put => tbs.tree.put(key, value),
            MsgOp::Del => tbs.tree.del(key),
        }
    }

    /// Deletes the fully replayed log file.
    pub fn close_and_remove(self) -> crate::Result<()> {
        let Self { filename, dir, file, .. } = self;
        drop(file);

        dir.delete_file(&filename)?;
        Ok(())
    }
}
