// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{log_file_name, parse_log_file_name, LogWriter};
use crate::{store::Directory, tree::msg::MsgOp, Lsn, Options, Slice, TableNo};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

struct LogChain {
    /// Redo logs ordered by log number; the last entry is the active one
    logs: BTreeMap<u64, Arc<LogWriter>>,

    /// Number the next log file will carry
    log_num: u64,
}

/// Owns the chain of redo logs and the background crons that flush,
/// fsync and clean them
///
/// Without a log directory the manager runs in no-log mode: writes skip
/// the WAL entirely and recovery has nothing to replay.
pub struct LogMgr {
    options: Arc<Options>,
    dir: Option<Arc<dyn Directory>>,

    chain: RwLock<LogChain>,
    last_checkpoint_lsn: AtomicU64,

    crons: Mutex<Vec<std::thread::JoinHandle<()>>>,

    /// Cleared on shutdown so the cron threads wind down
    alive: AtomicBool,
}

impl LogMgr {
    #[must_use]
    pub fn new(options: Arc<Options>, dir: Option<Arc<dyn Directory>>) -> Self {
        Self {
            options,
            dir,
            chain: RwLock::new(LogChain {
                logs: BTreeMap::new(),
                log_num: 0,
            }),
            last_checkpoint_lsn: AtomicU64::new(0),
            crons: Mutex::new(vec![]),
            alive: AtomicBool::new(true),
        }
    }

    /// Bootstraps the log numbering from surviving files and starts the
    /// flush, fsync and clean crons.
    pub fn init(this: &Arc<Self>) -> crate::Result<()> {
        let Some(dir) = &this.dir else {
            log::warn!("running in no-log mode, writes are not logged");
            return Ok(());
        };

        {
            let mut chain = this.chain.write().expect("lock is poisoned");
            debug_assert!(chain.logs.is_empty(), "log manager initialized twice");
            chain.log_num = Self::last_log_num(dir.as_ref())?;
        }

        let mut crons = this.crons.lock().expect("lock is poisoned");

        let periods_and_jobs: [(&str, u64, fn(&LogMgr)); 3] = [
            ("cascadb-log-flush", this.options.log_flush_period_ms, Self::flush),
            ("cascadb-log-fsync", this.options.log_fsync_period_ms, Self::fsync),
            ("cascadb-log-clean", this.options.log_clean_period_ms, Self::clean),
        ];

        for (name, period_ms, job) in periods_and_jobs {
            let mgr = this.clone();

            crons.push(
                std::thread::Builder::new()
                    .name(name.to_string())
                    .spawn(move || run_cron(&mgr, Duration::from_millis(period_ms), job))?,
            );

            log::debug!("{name} cron started, period {period_ms}ms");
        }

        Ok(())
    }

    fn last_log_num(dir: &dyn Directory) -> crate::Result<u64> {
        let mut last_num = 0;

        for name in dir.get_files()? {
            if let Some(log_num) = parse_log_file_name(&name) {
                last_num = last_num.max(log_num);
            }
        }

        Ok(last_num + 1)
    }

    /// Writes buffered records of all logs past the checkpoint out.
    pub fn flush(&self) {
        let chain = self.chain.read().expect("lock is poisoned");
        let horizon = self.last_checkpoint_lsn.load(SeqCst);

        for lw in chain.logs.values() {
            if lw.last_written_lsn() > horizon || lw.last_lsn() > lw.last_written_lsn() {
                lw.flush();
            }
        }
    }

    /// Makes written records of all logs past the checkpoint durable.
    pub fn fsync(&self) {
        let chain = self.chain.read().expect("lock is poisoned");
        let horizon = self.last_checkpoint_lsn.load(SeqCst);

        for lw in chain.logs.values() {
            if lw.last_written_lsn() > horizon || lw.last_fsync_lsn() < lw.last_written_lsn() {
                if let Err(e) = lw.fsync() {
                    log::error!("log fsync cron error: {e}");
                }
            }
        }
    }

    /// Deletes logs wholly behind the checkpoint that nobody writes to.
    pub fn clean(&self) {
        let mut chain = self.chain.write().expect("lock is poisoned");

        if chain.logs.len() < 2 {
            return;
        }

        let horizon = self.last_checkpoint_lsn.load(SeqCst);

        let obsolete: Vec<u64> = chain
            .logs
            .iter()
            .filter(|(_, lw)| lw.last_written_lsn() < horizon && lw.refs() == 0)
            .map(|(&num, _)| num)
            .collect();

        for num in obsolete {
            if let Some(lw) = chain.logs.remove(&num) {
                log::info!(
                    "delete log {num}, last_written lsn {}, last_checkpoint lsn {horizon}, logs left {}",
                    lw.last_written_lsn(),
                    chain.logs.len(),
                );
                lw.close_and_del_file();
            }
        }
    }

    /// The tail LSN across all logs.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        let chain = self.chain.read().expect("lock is poisoned");

        chain
            .logs
            .values()
            .next_back()
            .map_or_else(|| self.last_checkpoint_lsn.load(SeqCst), |lw| lw.last_lsn())
    }

    /// Flushes and fsyncs everything, returning the durable LSN the
    /// checkpoint may claim.
    pub fn make_checkpoint_begin(&self) -> Lsn {
        {
            let chain = self.chain.read().expect("lock is poisoned");
            if chain.logs.is_empty() {
                return 0;
            }
        }

        self.flush();
        self.fsync();

        let chain = self.chain.read().expect("lock is poisoned");
        chain
            .logs
            .values()
            .next_back()
            .map_or(0, |lw| lw.last_fsync_lsn())
    }

    /// Publishes the checkpoint horizon; logs wholly behind it become
    /// garbage for the clean cron.
    pub fn make_checkpoint_end(&self, lsn: Lsn) {
        self.last_checkpoint_lsn.store(lsn, SeqCst);
    }

    #[must_use]
    pub fn logs_count(&self) -> usize {
        self.chain.read().expect("lock is poisoned").logs.len()
    }

    /// Creates the next log file in the chain. Caller holds the write
    /// lock.
    fn egg_log(&self, chain: &mut LogChain, dir: &Arc<dyn Directory>) -> crate::Result<()> {
        let init_lsn = chain
            .logs
            .values()
            .next_back()
            .map_or_else(|| self.last_checkpoint_lsn.load(SeqCst), |lw| lw.last_lsn());

        let filename = log_file_name(chain.log_num);
        let lw = LogWriter::open(self.options.clone(), dir.clone(), filename.clone(), init_lsn)?;

        chain.logs.insert(chain.log_num, Arc::new(lw));
        chain.log_num += 1;

        log::info!("log {filename} created, init lsn {init_lsn}");
        Ok(())
    }

    /// Hands out the active log with a reference taken.
    ///
    /// An oversize log only rolls when no other writer holds it, so a
    /// record never splits across files mid-write.
    fn get_writer(&self) -> crate::Result<Option<Arc<LogWriter>>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };

        let mut chain = self.chain.write().expect("lock is poisoned");

        if chain.logs.is_empty() {
            self.egg_log(&mut chain, dir)?;
        }

        let mut lw = chain
            .logs
            .values()
            .next_back()
            .expect("chain is non-empty")
            .clone();

        if lw.oversize() {
            if lw.refs() == 0 {
                self.egg_log(&mut chain, dir)?;
            }
            lw = chain
                .logs
                .values()
                .next_back()
                .expect("chain is non-empty")
                .clone();
        }

        lw.inc_ref();
        Ok(Some(lw))
    }

    /// Appends a put record; `issync` forces it to disk before
    /// returning.
    pub fn enq_put(&self, key: &Slice, value: &Slice, tbn: TableNo, issync: bool) {
        match self.get_writer() {
            Ok(Some(lw)) => {
                if let Err(e) = lw.write(MsgOp::Put, key, value, tbn, issync) {
                    log::error!("enq put log error: {e}");
                }
                lw.dec_ref();
            }
            Ok(None) => {}
            Err(e) => log::error!("cannot open redo log: {e}"),
        }
    }

    /// Appends a delete record.
    pub fn enq_del(&self, key: &Slice, tbn: TableNo, issync: bool) {
        match self.get_writer() {
            Ok(Some(lw)) => {
                if let Err(e) = lw.write(MsgOp::Del, key, &Slice::empty(), tbn, issync) {
                    log::error!("enq del log error: {e}");
                }
                lw.dec_ref();
            }
            Ok(None) => {}
            Err(e) => log::error!("cannot open redo log: {e}"),
        }
    }
}

impl Drop for LogMgr {
    fn drop(&mut self) {
        self.alive.store(false, SeqCst);

        let mut crons = self.crons.lock().expect("lock is poisoned");
        for handle in crons.drain(..) {
            let _ = handle.join();
        }

        // a normal shutdown leaves nothing to replay, so the redo logs
        // can go
        let mut chain = self.chain.write().expect("lock is poisoned");
        for (num, lw) in std::mem::take(&mut chain.logs) {
            log::debug!("shutdown, deleting redo log {num}");
            lw.close_and_del_file();
        }
    }
}

fn run_cron(mgr: &LogMgr, period: Duration, job: fn(&LogMgr)) {
    let mut last_run = Instant::now();

    while mgr.alive.load(SeqCst) {
        std::thread::sleep(Duration::from_millis(20));

        if last_run.elapsed() >= period {
            job(mgr);
            last_run = Instant::now();
        }
    }
}
