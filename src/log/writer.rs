// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::LOG_HEADER_SIZE;
use crate::{
    checksum::Checksum,
    store::{Directory, SequenceFileWriter},
    tree::msg::MsgOp,
    Lsn, Options, Slice, TableNo,
};
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    io::Write,
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        Arc, Mutex, MutexGuard,
    },
};

struct OutState {
    buf: Vec<u8>,

    /// LSN up to which `buf` is complete; becomes `last_written_lsn`
    /// once the buffer hits the file
    pending_lsn: Lsn,

    writer: Box<dyn SequenceFileWriter>,
}

/// Appender for a single redo log file
///
/// Writers are admitted into the `in` buffer; when it fills up (or a
/// flush comes around) the two buffers swap and the `out` side drains to
/// the file, so disk writes never block record admission for long.
/// The lock order is strictly `in` before `out`.
pub(crate) struct LogWriter {
    options: Arc<Options>,
    dir: Arc<dyn Directory>,
    filename: String,

    last_lsn: AtomicU64,
    last_written_lsn: AtomicU64,
    last_fsync_lsn: AtomicU64,

    /// Record bytes appended to the file, for the rolling decision
    offset: AtomicU64,

    /// Writers currently holding this log, kept explicitly because the
    /// rolling decision needs a count the `Arc` cannot expose race-free
    refcnt: AtomicU64,

    in_buf: Mutex<Vec<u8>>,
    out: Mutex<OutState>,
}

impl LogWriter {
    /// Creates the log file and writes its header.
    pub fn open(
        options: Arc<Options>,
        dir: Arc<dyn Directory>,
        filename: String,
        init_lsn: Lsn,
    ) -> crate::Result<Self> {
        let mut writer = dir.open_sequence_file_writer(&filename)?;

        let mut header = Vec::with_capacity(LOG_HEADER_SIZE as usize);
        header.write_u64::<BigEndian>(init_lsn)?;
        let crc = Checksum::of(&header);
        header.write_u32::<BigEndian>(crc.into_u32())?;
        header.write_u64::<BigEndian>(0)?;
        writer.append(&header)?;

        let first_lsn = init_lsn + LOG_HEADER_SIZE;
        let bufsize = options.log_bufsize_byte;

        Ok(Self {
            options,
            dir,
            filename,
            last_lsn: AtomicU64::new(first_lsn),
            last_written_lsn: AtomicU64::new(first_lsn),
            last_fsync_lsn: AtomicU64::new(first_lsn),
            offset: AtomicU64::new(0),
            refcnt: AtomicU64::new(0),
            in_buf: Mutex::new(Vec::with_capacity(bufsize)),
            out: Mutex::new(OutState {
                buf: Vec::with_capacity(bufsize),
                pending_lsn: first_lsn,
                writer,
            }),
        })
    }

    /// LSN after the last record admitted into the log buffer.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn.load(SeqCst)
    }

    /// LSN up to which records reached the file.
    #[must_use]
    pub fn last_written_lsn(&self) -> Lsn {
        self.last_written_lsn.load(SeqCst)
    }

    /// LSN up to which records are durable; this is the checkpoint LSN
    /// candidate.
    #[must_use]
    pub fn last_fsync_lsn(&self) -> Lsn {
        self.last_fsync_lsn.load(SeqCst)
    }

    #[must_use]
    pub fn filesize(&self) -> u64 {
        self.offset.load(SeqCst)
    }

    #[must_use]
    pub fn refs(&self) -> u64 {
        self.refcnt.load(SeqCst)
    }

    pub fn inc_ref(&self) {
        self.refcnt.fetch_add(1, SeqCst);
    }

    pub fn dec_ref(&self) {
        let prev = self.refcnt.fetch_sub(1, SeqCst);
        debug_assert!(prev > 0, "log writer ref underflow");
    }

    /// `true` once the file outgrew `log_filesize_byte` and should roll.
    #[must_use]
    pub fn oversize(&self) -> bool {
        self.offset.load(SeqCst) > self.options.log_filesize_byte
    }

    /// Frames and buffers one record.
    ///
    /// The record's LSN is assigned here and the tail LSN advances by
    /// the framed length, so LSNs double as file offsets. `issync`
    /// forces the record to disk before returning.
    pub fn write(
        &self,
        op: MsgOp,
        key: &Slice,
        value: &Slice,
        tbn: TableNo,
        issync: bool,
    ) -> crate::Result<()> {
        let len = 4                    // len at the beginning
            + 8                        // lsn
            + 4                        // table number
            + 1                        // op
            + 4 + key.len()
            + 4 + value.len()          // empty for Del
            + 4                        // crc
            + 4; // len at the end

        let mut in_g = self.in_buf.lock().expect("lock is poisoned");

        // a full buffer swaps out before admitting the record; if the
        // drain cannot make room (disk trouble, racing writers) the
        // buffer simply grows past its nominal size
        if !in_g.is_empty() && in_g.len() + len > self.options.log_bufsize_byte {
            in_g = self.swap_and_drain(in_g);
        }

        let start = in_g.len();
        let lsn = self.last_lsn.load(SeqCst);

        #[allow(clippy::cast_possible_truncation)]
        {
            in_g.write_u32::<BigEndian>(len as u32)?;
            in_g.write_u64::<BigEndian>(lsn)?;
            in_g.write_u32::<BigEndian>(tbn)?;
            in_g.write_u8(op as u8)?;
            in_g.write_u32::<BigEndian>(key.len() as u32)?;
            in_g.write_all(key)?;
            in_g.write_u32::<BigEndian>(value.len() as u32)?;
            in_g.write_all(value)?;

            // everything between the leading length and the crc itself
            let crc = Checksum::of(in_g.get(start + 4..).unwrap_or_default());
            in_g.write_u32::<BigEndian>(crc.into_u32())?;
            in_g.write_u32::<BigEndian>(len as u32)?;
        }

        debug_assert_eq!(start + len, in_g.len(), "framed length mismatch");
        self.last_lsn.store(lsn + len as u64, SeqCst);
        drop(in_g);

        if issync {
            self.flush();
            self.fsync()?;
        }

        Ok(())
    }

    /// Swaps the full `in` buffer out and drains it, letting other
    /// writers into the fresh buffer while the disk write runs.
    fn swap_and_drain<'a>(&'a self, mut in_g: MutexGuard<'a, Vec<u8>>) -> MutexGuard<'a, Vec<u8>> {
        {
            let mut out_g = self.out.lock().expect("lock is poisoned");

            // a previously failed append may have left data behind; it
            // must drain first or the swap would scramble record order
            self.write_outbuf(&mut out_g);
            if !out_g.buf.is_empty() {
                return in_g;
            }

            std::mem::swap(&mut *in_g, &mut out_g.buf);
            out_g.pending_lsn = self.last_lsn.load(SeqCst);
            drop(in_g);

            self.write_outbuf(&mut out_g);
        }

        self.in_buf.lock().expect("lock is poisoned")
    }

    /// Swaps buffers and writes buffered records to the file.
    ///
    /// A no-op when another thread currently owns the drain path.
    pub fn flush(&self) {
        if self.last_written_lsn.load(SeqCst) == self.last_lsn.load(SeqCst) {
            return;
        }

        let mut in_g = self.in_buf.lock().expect("lock is poisoned");

        // try only: if someone else is draining, our records are on
        // their way out already
        let Ok(mut out_g) = self.out.try_lock() else {
            return;
        };

        self.write_outbuf(&mut out_g);
        if !out_g.buf.is_empty() {
            return;
        }

        std::mem::swap(&mut *in_g, &mut out_g.buf);
        out_g.pending_lsn = self.last_lsn.load(SeqCst);
        drop(in_g);

        self.write_outbuf(&mut out_g);
    }

    fn write_outbuf(&self, out_g: &mut OutState) {
        if out_g.buf.is_empty() {
            return;
        }

        match out_g.writer.append(&out_g.buf) {
            Ok(()) => {
                self.offset.fetch_add(out_g.buf.len() as u64, SeqCst);
                self.last_written_lsn.store(out_g.pending_lsn, SeqCst);
                out_g.buf.clear();
            }
            Err(e) => {
                // keep the buffer for a retry on the next drain
                log::error!(
                    "write logfile {}, offset {}, size {} error: {e}",
                    self.filename,
                    self.offset.load(SeqCst),
                    out_g.buf.len(),
                );
            }
        }
    }

    /// Durably syncs everything written so far.
    pub fn fsync(&self) -> crate::Result<()> {
        if self.last_fsync_lsn.load(SeqCst) == self.last_written_lsn.load(SeqCst) {
            return Ok(());
        }

        let mut out_g = self.out.lock().expect("lock is poisoned");
        let target = self.last_written_lsn.load(SeqCst);

        if let Err(e) = out_g.writer.flush() {
            log::error!("sync logfile {} error: {e}", self.filename);
            return Err(e);
        }

        self.last_fsync_lsn.store(target, SeqCst);
        Ok(())
    }

    pub fn close(&self) {
        self.flush();
        if let Err(e) = self.fsync() {
            log::error!("close logfile {} error: {e}", self.filename);
        }
    }

    pub fn close_and_del_file(&self) {
        self.close();

        debug_assert_eq!(
            self.last_fsync_lsn.load(SeqCst),
            self.last_written_lsn.load(SeqCst),
        );

        if let Err(e) = self.dir.delete_file(&self.filename) {
            log::error!("delete logfile {} error: {e}", self.filename);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RamDirectory;
    use test_log::test;

    fn writer(bufsize: usize) -> (Arc<RamDirectory>, LogWriter) {
        let dir = Arc::new(RamDirectory::new());
        let options = Arc::new(Options {
            log_bufsize_byte: bufsize,
            ..Options::default()
        });

        let log = LogWriter::open(options, dir.clone(), "cdb000001.redolog".into(), 0)
            .expect("should create log");

        (dir, log)
    }

    #[test]
    fn log_writer_lsn_math() -> crate::Result<()> {
        let (_dir, log) = writer(4 * 1_024);

        let loops = 1_000u64;
        let len = (4 + 8 + 4 + 1 + 4 + 4 + 4 + 4 + 4 + 4) as u64;

        let k = Slice::from("key1");
        let v = Slice::from("val1");
        for _ in 0..loops {
            log.write(MsgOp::Put, &k, &v, 0, false)?;
        }

        // a delete still carries a zero value length
        let del_len = (4 + 8 + 4 + 1 + 4 + 4 + 4 + 4 + 4) as u64;
        log.write(MsgOp::Del, &k, &Slice::empty(), 0, false)?;

        assert_eq!(loops * len + del_len + LOG_HEADER_SIZE, log.last_lsn());
        Ok(())
    }

    #[test]
    fn log_writer_overflow_swaps() -> crate::Result<()> {
        let (dir, log) = writer(1_024);

        let key = Slice::from(vec![0u8; 512]);
        let value = Slice::from(vec![0u8; 512]);
        let len = (4 + 8 + 4 + 1 + 4 + 512 + 4 + 512 + 4 + 4) as u64;

        let loops = 100u64;
        for _ in 0..loops {
            log.write(MsgOp::Put, &key, &value, 0, false)?;
        }

        assert_eq!(loops * len + LOG_HEADER_SIZE, log.last_lsn());

        // all but the last record must already be on disk: every record
        // is bigger than the buffer, so each write swaps out its
        // predecessor
        assert!(log.filesize() >= (loops - 1) * len);

        log.flush();
        log.fsync()?;
        assert_eq!(log.last_lsn(), log.last_fsync_lsn());
        assert_eq!(
            LOG_HEADER_SIZE + loops * len,
            dir.file_length("cdb000001.redolog"),
        );

        Ok(())
    }

    #[test]
    fn log_writer_flush_then_fsync_ladder() -> crate::Result<()> {
        let (_dir, log) = writer(1 << 20);

        let k = Slice::from("k");
        let v = Slice::from("v");
        log.write(MsgOp::Put, &k, &v, 7, false)?;

        // buffered only
        assert!(log.last_written_lsn() < log.last_lsn());

        log.flush();
        assert_eq!(log.last_lsn(), log.last_written_lsn());
        assert!(log.last_fsync_lsn() < log.last_written_lsn());

        log.fsync()?;
        assert_eq!(log.last_written_lsn(), log.last_fsync_lsn());
        Ok(())
    }

    #[test]
    fn log_writer_delete_file() -> crate::Result<()> {
        let (dir, log) = writer(1_024);

        let k = Slice::from("k");
        let v = Slice::from("v");
        log.write(MsgOp::Put, &k, &v, 0, true)?;

        assert!(dir.file_exists("cdb000001.redolog"));
        log.close_and_del_file();
        assert!(!dir.file_exists("cdb000001.redolog"));
        Ok(())
    }
}
