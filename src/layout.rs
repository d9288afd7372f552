// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    checksum::Checksum,
    store::RandomAccessFile,
    Bid, CompressionType, Lsn, Options, Status,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::{
    io::{Cursor, Write},
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        mpsc::{channel, sync_channel, Receiver, Sender, SyncSender},
        Arc, Mutex,
    },
};

pub const PAGE_SIZE: u64 = 4_096;
pub const SUPER_BLOCK_SIZE: u64 = 4_096;

const SUPER_BLOCK_MAGIC: [u8; 8] = *b"CASCADB\0";
const VERSION_MAJOR: u8 = 0;
const VERSION_MINOR: u8 = 1;

pub fn page_round_up(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// A buffer holding one serialized node
///
/// Created with an upper-bound capacity before serialization; the
/// serialized form must not exceed that estimate.
pub struct Block {
    data: Vec<u8>,
    capacity: usize,
}

impl Block {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let capacity = data.len();
        Self { data, capacity }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The size the block was allocated for.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn writer(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Completion callback for an asynchronous block write
pub type WriteCallback = Box<dyn FnOnce(bool) + Send>;

/// On-disk home of a tree's nodes
///
/// The cache is the only writer; the log reader additionally consults
/// [`Layout::checkpoint_lsn`] to decide which redo records still matter.
pub trait Layout: Send + Sync {
    /// Prepares the layout; `create` seeds a fresh data file.
    fn init(&self, create: bool) -> crate::Result<()>;

    /// Reads a node block; blocking.
    fn read(&self, nid: Bid, skeleton_only: bool) -> crate::Result<Block>;

    /// Allocates a write block for an estimated serialized size.
    fn create(&self, size: usize) -> Block;

    /// Queues a block write; the callback fires on completion with a
    /// success flag. Completion may be reordered relative to other writes.
    fn async_write(&self, nid: Bid, block: Block, skeleton_size: usize, callback: WriteCallback);

    /// Forgets a node's block.
    fn delete_block(&self, nid: Bid);

    /// Durably syncs the data file.
    fn flush(&self) -> crate::Result<()>;

    /// Publishes a checkpoint: all node state up to `lsn` is on disk.
    fn make_checkpoint(&self, lsn: Lsn) -> crate::Result<()>;

    /// The LSN of the last published checkpoint.
    fn checkpoint_lsn(&self) -> Lsn;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct BlockHandle {
    offset: u64,
    size: u32,
    skeleton_size: u32,
}

struct LayoutInner {
    index: FxHashMap<Bid, BlockHandle>,

    /// Next allocation offset; extents are never reused, a new write of
    /// the same nid gets a fresh extent and the old one becomes garbage
    /// until the file is compacted offline.
    tail: u64,
}

struct LayoutShared {
    file: Arc<dyn RandomAccessFile>,
    compress: CompressionType,
    check_crc: bool,
    status: Arc<Status>,
    inner: Mutex<LayoutInner>,
    checkpoint_lsn: AtomicU64,
}

enum AioJob {
    Write {
        nid: Bid,
        block: Block,
        skeleton_size: usize,
        callback: WriteCallback,
    },
    Barrier(SyncSender<()>),
    Shutdown,
}

/// A [`Layout`] that stores page-rounded block extents in a single file
///
/// Offset 0 holds a super block (magic, version, checkpoint LSN and a
/// pointer to the block index); the index itself is only persisted by
/// [`Layout::make_checkpoint`], so everything newer than the checkpoint
/// is reconstructed from the redo log on recovery.
pub struct BlockLayout {
    shared: Arc<LayoutShared>,
    queue: Sender<AioJob>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BlockLayout {
    pub fn new(
        file: Arc<dyn RandomAccessFile>,
        options: &Options,
        status: Arc<Status>,
    ) -> Self {
        let shared = Arc::new(LayoutShared {
            file,
            compress: options.compress,
            check_crc: options.check_crc,
            status,
            inner: Mutex::new(LayoutInner {
                index: FxHashMap::default(),
                tail: SUPER_BLOCK_SIZE,
            }),
            checkpoint_lsn: AtomicU64::new(0),
        });

        let (tx, rx) = channel();

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("cascadb-aio".to_string())
                .spawn(move || aio_main(&shared, &rx))
                .expect("should be able to spawn aio thread")
        };

        Self {
            shared,
            queue: tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn write_super_block_with(&self, index_offset: u64, index_size: u32) -> crate::Result<()> {
        let mut buf = Vec::with_capacity(SUPER_BLOCK_SIZE as usize);
        buf.write_all(&SUPER_BLOCK_MAGIC)?;
        buf.write_u8(VERSION_MAJOR)?;
        buf.write_u8(VERSION_MINOR)?;
        buf.write_u64::<BigEndian>(self.shared.checkpoint_lsn.load(SeqCst))?;
        buf.write_u64::<BigEndian>(index_offset)?;
        buf.write_u32::<BigEndian>(index_size)?;

        let crc = Checksum::of(&buf);
        buf.write_u32::<BigEndian>(crc.into_u32())?;
        buf.resize(SUPER_BLOCK_SIZE as usize, 0);

        self.shared.file.write_at(0, &buf)?;
        Ok(())
    }

    fn read_super_block(&self) -> crate::Result<(Lsn, u64, u32)> {
        let mut buf = vec![0; SUPER_BLOCK_SIZE as usize];
        self.shared.file.read_at(0, &mut buf)?;

        let payload_len = SUPER_BLOCK_MAGIC.len() + 1 + 1 + 8 + 8 + 4;

        let mut cursor = Cursor::new(&buf);
        let mut magic = [0u8; 8];
        std::io::Read::read_exact(&mut cursor, &mut magic)?;

        if magic != SUPER_BLOCK_MAGIC {
            return Err(crate::Error::InvalidSuperBlock);
        }

        let _major = cursor.read_u8()?;
        let _minor = cursor.read_u8()?;
        let lsn = cursor.read_u64::<BigEndian>()?;
        let index_offset = cursor.read_u64::<BigEndian>()?;
        let index_size = cursor.read_u32::<BigEndian>()?;
        let expected = Checksum::from_raw(cursor.read_u32::<BigEndian>()?);

        #[allow(clippy::indexing_slicing)]
        Checksum::of(&buf[..payload_len]).check(expected)?;

        Ok((lsn, index_offset, index_size))
    }

    fn load_index(&self, offset: u64, size: u32) -> crate::Result<()> {
        let mut buf = vec![0; size as usize];
        self.shared.file.read_at(offset, &mut buf)?;

        let mut cursor = Cursor::new(&buf);
        let count = cursor.read_u32::<BigEndian>()?;

        let mut index = FxHashMap::default();
        for _ in 0..count {
            let nid = cursor.read_u64::<BigEndian>()?;
            let handle = BlockHandle {
                offset: cursor.read_u64::<BigEndian>()?,
                size: cursor.read_u32::<BigEndian>()?,
                skeleton_size: cursor.read_u32::<BigEndian>()?,
            };
            index.insert(nid, handle);
        }

        let body_len = cursor.position() as usize;
        let expected = Checksum::from_raw(cursor.read_u32::<BigEndian>()?);

        #[allow(clippy::indexing_slicing)]
        Checksum::of(&buf[..body_len]).check(expected)?;

        let mut inner = self.shared.inner.lock().expect("lock is poisoned");
        inner.index = index;
        Ok(())
    }

    /// Waits until every queued block write has hit the file.
    fn drain_writes(&self) {
        let (tx, rx) = sync_channel(0);
        if self.queue.send(AioJob::Barrier(tx)).is_ok() {
            // a dropped sender means the worker is gone; nothing to wait for
            let _ = rx.recv();
        }
    }
}

impl Layout for BlockLayout {
    fn init(&self, create: bool) -> crate::Result<()> {
        if create {
            // a zero index offset means "no index written yet"
            self.write_super_block_with(0, 0)?;
            self.shared.file.sync()?;
            return Ok(());
        }

        let (lsn, index_offset, index_size) = self.read_super_block()?;
        self.shared.checkpoint_lsn.store(lsn, SeqCst);

        if index_offset != 0 {
            self.load_index(index_offset, index_size)?;
        }

        let mut inner = self.shared.inner.lock().expect("lock is poisoned");
        inner.tail = page_round_up(self.shared.file.len()?.max(SUPER_BLOCK_SIZE));

        log::debug!(
            "opened layout, checkpoint lsn {lsn}, {} blocks, tail {}",
            inner.index.len(),
            inner.tail,
        );

        Ok(())
    }

    fn read(&self, nid: Bid, skeleton_only: bool) -> crate::Result<Block> {
        let handle = {
            let inner = self.shared.inner.lock().expect("lock is poisoned");
            *inner.index.get(&nid).ok_or(crate::Error::BlockNotFound(nid))?
        };

        if skeleton_only {
            Status::bump(&self.shared.status.subblock_read_num);
        } else {
            Status::bump(&self.shared.status.block_read_num);
        }

        let mut buf = vec![0; handle.size as usize];
        self.shared.file.read_at(handle.offset, &mut buf)?;

        let mut cursor = Cursor::new(&buf);
        let stored_len = cursor.read_u32::<BigEndian>()? as usize;
        let expected = Checksum::from_raw(cursor.read_u32::<BigEndian>()?);

        let payload_start = cursor.position() as usize;
        let payload_end = payload_start + stored_len;

        let payload = buf
            .get(payload_start..payload_end)
            .ok_or(crate::Error::BlockNotFound(nid))?;

        if self.shared.check_crc {
            Checksum::of(payload).check(expected)?;
        }

        Ok(Block::from_vec(CompressionType::decompress(payload)?))
    }

    fn create(&self, size: usize) -> Block {
        Block::with_capacity(size)
    }

    fn async_write(&self, nid: Bid, block: Block, skeleton_size: usize, callback: WriteCallback) {
        Status::bump(&self.shared.status.async_write_num);
        Status::add(&self.shared.status.async_write_byte, block.len() as u64);

        if self
            .queue
            .send(AioJob::Write {
                nid,
                block,
                skeleton_size,
                callback,
            })
            .is_err()
        {
            log::error!("aio worker is gone, dropping write of node {nid}");
        }
    }

    fn delete_block(&self, nid: Bid) {
        let mut inner = self.shared.inner.lock().expect("lock is poisoned");
        inner.index.remove(&nid);
    }

    fn flush(&self) -> crate::Result<()> {
        self.drain_writes();
        self.shared.file.sync()?;
        Ok(())
    }

    fn make_checkpoint(&self, lsn: Lsn) -> crate::Result<()> {
        // all flushed nodes must be in the file before the index snapshot
        // claims they are
        self.drain_writes();

        let mut buf = vec![];
        let (index_offset, index_size) = {
            let mut inner = self.shared.inner.lock().expect("lock is poisoned");

            #[allow(clippy::cast_possible_truncation)]
            buf.write_u32::<BigEndian>(inner.index.len() as u32)?;

            for (nid, handle) in &inner.index {
                buf.write_u64::<BigEndian>(*nid)?;
                buf.write_u64::<BigEndian>(handle.offset)?;
                buf.write_u32::<BigEndian>(handle.size)?;
                buf.write_u32::<BigEndian>(handle.skeleton_size)?;
            }

            let crc = Checksum::of(&buf);
            buf.write_u32::<BigEndian>(crc.into_u32())?;

            let offset = inner.tail;
            inner.tail += page_round_up(buf.len() as u64);

            #[allow(clippy::cast_possible_truncation)]
            (offset, buf.len() as u32)
        };

        self.shared.file.write_at(index_offset, &buf)?;
        self.shared.file.sync()?;

        self.shared.checkpoint_lsn.store(lsn, SeqCst);
        self.write_super_block_with(index_offset, index_size)?;

        log::debug!("layout checkpoint at lsn {lsn}, index {index_size}B @ {index_offset}");
        Ok(())
    }

    fn checkpoint_lsn(&self) -> Lsn {
        self.shared.checkpoint_lsn.load(SeqCst)
    }
}

impl Drop for BlockLayout {
    fn drop(&mut self) {
        let _ = self.queue.send(AioJob::Shutdown);

        let mut worker = self.worker.lock().expect("lock is poisoned");
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
    }
}

fn aio_main(shared: &LayoutShared, rx: &Receiver<AioJob>) {
    while let Ok(job) = rx.recv() {
        match job {
            AioJob::Write {
                nid,
                block,
                skeleton_size,
                callback,
            } => {
                let succ = perform_write(shared, nid, &block, skeleton_size).is_ok();
                callback(succ);
            }

            AioJob::Barrier(done) => {
                let _ = done.send(());
            }

            AioJob::Shutdown => break,
        }
    }
}

fn perform_write(
    shared: &LayoutShared,
    nid: Bid,
    block: &Block,
    skeleton_size: usize,
) -> crate::Result<()> {
    let payload = shared.compress.compress(block.bytes());

    let mut framed = Vec::with_capacity(8 + payload.len());

    #[allow(clippy::cast_possible_truncation)]
    framed.write_u32::<BigEndian>(payload.len() as u32)?;
    framed.write_u32::<BigEndian>(Checksum::of(&payload).into_u32())?;
    framed.write_all(&payload)?;

    let handle = {
        let mut inner = shared.inner.lock().expect("lock is poisoned");
        let offset = inner.tail;
        inner.tail += page_round_up(framed.len() as u64);

        #[allow(clippy::cast_possible_truncation)]
        let handle = BlockHandle {
            offset,
            size: framed.len() as u32,
            skeleton_size: skeleton_size as u32,
        };

        inner.index.insert(nid, handle);
        handle
    };

    shared.file.write_at(handle.offset, &framed)?;

    log::trace!("wrote node {nid}, {} bytes @ {}", handle.size, handle.offset);
    Ok(())
}
