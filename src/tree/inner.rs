// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{decode_slice, encode_slice},
    tree::{
        msg::{Msg, MsgBuf},
        node::{CascadeResult, Node, NodeBase, NodeOps, SplitInfo, NID_NIL},
        TreeInner,
    },
    Bid, Options, Slice, Status, TableNo,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    cmp::Ordering,
    io::Cursor,
    sync::atomic::{AtomicUsize, Ordering::SeqCst},
    sync::{Arc, Mutex, RwLock, RwLockWriteGuard},
};

const INNER_HEADER_SIZE: usize = 1 + 8 + 4;

pub(crate) struct Pivot {
    key: Slice,
    child: Bid,
    msgbuf: Mutex<MsgBuf>,
}

struct InnerCore {
    /// `true` iff the children are leaves
    bottom: bool,

    /// Child for keys below the first pivot key; [`NID_NIL`] only while
    /// the tree is empty
    first_child: Bid,

    first_msgbuf: Mutex<MsgBuf>,

    /// Strictly ascending; `pivots[i]` routes keys in
    /// `[pivots[i].key, pivots[i+1].key)`
    pivots: Vec<Pivot>,
}

/// Routing node carrying one message buffer per child
///
/// Writes land in the buffer of the slot covering their key and only
/// move down (cascade) when the node's combined buffers overflow.
pub struct InnerNode {
    base: NodeBase,
    options: Arc<Options>,
    status: Arc<Status>,

    // buffered message count/bytes across all slots, kept outside the
    // core lock so `is_full` and cache size scans never block on a pin
    msg_count: AtomicUsize,
    msg_size: AtomicUsize,

    // pivot table bookkeeping mirrored outside the lock, for `size`
    pivot_count: AtomicUsize,
    pivot_meta_size: AtomicUsize,

    core: RwLock<InnerCore>,
}

impl InnerNode {
    #[must_use]
    pub fn new(tbn: TableNo, nid: Bid, options: Arc<Options>, status: Arc<Status>) -> Self {
        let comparator = options.comparator.clone();

        Self {
            base: NodeBase::new(tbn, nid),
            options,
            status,
            msg_count: AtomicUsize::new(0),
            msg_size: AtomicUsize::new(0),
            pivot_count: AtomicUsize::new(0),
            pivot_meta_size: AtomicUsize::new(0),
            core: RwLock::new(InnerCore {
                bottom: true,
                first_child: NID_NIL,
                first_msgbuf: Mutex::new(MsgBuf::new(comparator)),
                pivots: vec![],
            }),
        }
    }

    /// Resets this node to the state of an empty tree's root.
    pub(crate) fn init_empty_root(&self) {
        let mut core = self.core.write().expect("lock is poisoned");
        core.bottom = true;
        core.first_child = NID_NIL;
        core.pivots.clear();
        core.first_msgbuf.lock().expect("lock is poisoned").clear();

        self.recount(&core);
        self.base.set_dirty(true);
    }

    /// Installs this node as the new root above a split root.
    pub(crate) fn pileup_from(&self, old_root: Bid, promoted: SplitInfo) {
        let comparator = self.options.comparator.clone();

        let mut core = self.core.write().expect("lock is poisoned");
        core.bottom = false;
        core.first_child = old_root;
        core.pivots = vec![Pivot {
            key: promoted.key,
            child: promoted.sibling,
            msgbuf: Mutex::new(MsgBuf::new(comparator)),
        }];

        self.recount(&core);
        self.base.set_dirty(true);
    }

    fn is_full(&self) -> bool {
        self.msg_count.load(SeqCst) >= self.options.inner_node_msg_count
            || self.msg_size.load(SeqCst) >= self.options.inner_node_page_size
    }

    fn adjust_counters(&self, count_before: usize, size_before: usize, buf: &MsgBuf) {
        let (count_after, size_after) = (buf.count(), buf.size());

        if count_after >= count_before {
            self.msg_count.fetch_add(count_after - count_before, SeqCst);
        } else {
            self.msg_count.fetch_sub(count_before - count_after, SeqCst);
        }

        if size_after >= size_before {
            self.msg_size.fetch_add(size_after - size_before, SeqCst);
        } else {
            self.msg_size.fetch_sub(size_before - size_after, SeqCst);
        }
    }

    fn recount(&self, core: &InnerCore) {
        let mut count = 0;
        let mut size = 0;

        {
            let buf = core.first_msgbuf.lock().expect("lock is poisoned");
            count += buf.count();
            size += buf.size();
        }

        for pivot in &core.pivots {
            let buf = pivot.msgbuf.lock().expect("lock is poisoned");
            count += buf.count();
            size += buf.size();
        }

        self.msg_count.store(count, SeqCst);
        self.msg_size.store(size, SeqCst);

        self.pivot_count.store(core.pivots.len(), SeqCst);
        self.pivot_meta_size.store(
            core.pivots.iter().map(|p| 4 + p.key.len() + 8).sum(),
            SeqCst,
        );
    }

    /// Index of the slot covering `key`: 0 is the first child, `i + 1`
    /// the child of `pivots[i]`.
    fn slot_of(&self, core: &InnerCore, key: &[u8]) -> usize {
        let cmp = &self.options.comparator;
        core.pivots
            .partition_point(|p| cmp.compare(&p.key, key) != Ordering::Greater)
    }

    fn slot_buf<'a>(core: &'a InnerCore, slot: usize) -> &'a Mutex<MsgBuf> {
        if slot == 0 {
            &core.first_msgbuf
        } else {
            core.pivots
                .get(slot - 1)
                .map(|p| &p.msgbuf)
                .expect("slot index out of range")
        }
    }

    fn slot_child(core: &InnerCore, slot: usize) -> Bid {
        if slot == 0 {
            core.first_child
        } else {
            core.pivots.get(slot - 1).map_or(NID_NIL, |p| p.child)
        }
    }

    /// Buffers a message in the slot covering its key.
    pub(crate) fn write_msg(&self, msg: Msg) {
        self.base.touch();

        let core = self.core.read().expect("lock is poisoned");
        let slot = self.slot_of(&core, &msg.key);

        let mut buf = Self::slot_buf(&core, slot).lock().expect("lock is poisoned");
        let (count_before, size_before) = (buf.count(), buf.size());
        buf.write(msg);
        self.adjust_counters(count_before, size_before, &buf);
        drop(buf);
        drop(core);

        self.base.set_dirty(true);
    }

    /// Root entry point: buffer the message, then relieve the node if
    /// its buffers overflowed.
    pub(crate) fn put(&self, msg: Msg, tree: &TreeInner) -> crate::Result<()> {
        self.write_msg(msg);

        if self.is_full() {
            self.cascade_root(tree)?;
        }

        Ok(())
    }

    fn cascade_root(&self, tree: &TreeInner) -> crate::Result<()> {
        let mut core = self.core.write().expect("lock is poisoned");

        // another writer may have cascaded while we waited for the pin
        if !self.is_full() {
            return Ok(());
        }

        let result = self.cascade_locked(&mut core, tree)?;

        // keep the pin through the root swap so no writer slips in
        // between the structural change and the new root being published
        if result.emptied {
            tree.collapse()?;
        } else if let Some(promoted) = result.splits.into_iter().next() {
            tree.pileup(self.base.nid(), promoted)?;
        }

        drop(core);
        Ok(())
    }

    /// Absorbs messages cascaded down by the parent, relieving and
    /// restructuring this node as needed.
    pub(crate) fn cascade(
        &self,
        incoming: Vec<Msg>,
        tree: &TreeInner,
    ) -> crate::Result<CascadeResult> {
        self.base.touch();

        let mut core = self.core.write().expect("lock is poisoned");
        self.absorb_locked(&core, incoming);
        self.base.set_dirty(true);

        let result = self.cascade_locked(&mut core, tree)?;
        drop(core);

        if result.emptied {
            // the parent removes us next; zombies are reaped by the cache
            self.base.set_dead();
        }

        Ok(result)
    }

    /// Splits a sorted run across the slot buffers by pivot boundaries.
    fn absorb_locked(&self, core: &InnerCore, incoming: Vec<Msg>) {
        let cmp = &self.options.comparator;
        let mut rest = incoming;

        for slot in 0..=core.pivots.len() {
            let run = match core.pivots.get(slot) {
                Some(pivot) => {
                    let idx = rest
                        .partition_point(|m| cmp.compare(&m.key, &pivot.key) == Ordering::Less);
                    let tail = rest.split_off(idx);
                    std::mem::replace(&mut rest, tail)
                }
                // last slot takes everything that is left
                None => std::mem::take(&mut rest),
            };

            if run.is_empty() {
                continue;
            }

            let mut buf = Self::slot_buf(core, slot).lock().expect("lock is poisoned");
            let (count_before, size_before) = (buf.count(), buf.size());
            buf.append(run);
            self.adjust_counters(count_before, size_before, &buf);
        }
    }

    /// Relieves overflowing buffers one child at a time, then checks
    /// whether this node itself has to split or vanish.
    fn cascade_locked(
        &self,
        core: &mut RwLockWriteGuard<'_, InnerCore>,
        tree: &TreeInner,
    ) -> crate::Result<CascadeResult> {
        while self.is_full() {
            if !self.cascade_one_child(core, tree)? {
                break;
            }
        }

        let mut result = CascadeResult::default();

        if core.first_child == NID_NIL && core.pivots.is_empty() {
            result.emptied = true;
            return Ok(result);
        }

        if core.pivots.len() >= self.options.inner_node_children_number
            || self.encoded_size_locked(core) >= self.options.inner_node_page_size
        {
            result.splits.push(self.split_locked(core, tree)?);
        }

        Ok(result)
    }

    /// Moves the largest slot buffer into its child.
    ///
    /// Returns `false` when there was nothing to move.
    fn cascade_one_child(
        &self,
        core: &mut RwLockWriteGuard<'_, InnerCore>,
        tree: &TreeInner,
    ) -> crate::Result<bool> {
        // greedy maximum-work: pick the child whose incoming buffer is
        // largest by byte size
        let mut slot = 0;
        let mut largest = 0;

        for candidate in 0..=core.pivots.len() {
            let size = Self::slot_buf(core, candidate)
                .lock()
                .expect("lock is poisoned")
                .size();

            if size > largest {
                largest = size;
                slot = candidate;
            }
        }

        if largest == 0 {
            return Ok(false);
        }

        // an empty bottom root grows its first leaf on demand
        if slot == 0 && core.first_child == NID_NIL {
            debug_assert!(core.bottom, "only a bottom node may be childless");
            core.first_child = tree.new_leaf_node()?.nid();
        }

        let child_nid = Self::slot_child(core, slot);

        let run = {
            let mut buf = Self::slot_buf(core, slot).lock().expect("lock is poisoned");
            let (count_before, size_before) = (buf.count(), buf.size());
            let run = buf.take();
            self.adjust_counters(count_before, size_before, &buf);
            run
        };

        Status::bump(&self.status.innernode_cascade_num);

        let child = tree.load_node(child_nid, false)?;
        let outcome = match &*child {
            Node::Leaf(leaf) => leaf.cascade(run, tree)?,
            Node::Inner(inner) => inner.cascade(run, tree)?,
            Node::Schema(_) => unreachable!("schema node cannot be a tree child"),
        };

        self.base.set_dirty(true);

        for split in outcome.splits {
            self.add_pivot_locked(core, split.key, split.sibling);
        }

        if outcome.emptied {
            child.set_dead();
            self.rm_pivot_locked(core, child_nid);
        }

        Ok(true)
    }

    /// Moves the upper half of the pivots into a fresh sibling.
    ///
    /// The median pivot's child and buffer become the sibling's first
    /// child and buffer; the median key is promoted to the caller.
    fn split_locked(
        &self,
        core: &mut RwLockWriteGuard<'_, InnerCore>,
        tree: &TreeInner,
    ) -> crate::Result<SplitInfo> {
        Status::bump(&self.status.innernode_split_num);

        let m = core.pivots.len() / 2;
        let mut tail = core.pivots.split_off(m);
        debug_assert!(!tail.is_empty(), "split requires at least one pivot to move");
        let head = tail.remove(0);

        let sibling = tree.new_inner_node()?;
        let Some(new_inner) = sibling.as_inner() else {
            unreachable!("inner factory returned a non-inner node");
        };

        {
            let mut sibling_core = new_inner.core.write().expect("lock is poisoned");
            sibling_core.bottom = core.bottom;
            sibling_core.first_child = head.child;
            sibling_core.first_msgbuf = head.msgbuf;
            sibling_core.pivots = tail;
            new_inner.recount(&sibling_core);
        }

        new_inner.base().set_dirty(true);
        self.recount(core);

        log::trace!(
            "inner {} split, promoted key {:?}, sibling {}",
            self.base.nid(),
            head.key,
            sibling.nid(),
        );

        Ok(SplitInfo {
            key: head.key,
            sibling: sibling.nid(),
        })
    }

    /// Inserts a pivot for a freshly split-off child.
    fn add_pivot_locked(&self, core: &mut RwLockWriteGuard<'_, InnerCore>, key: Slice, child: Bid) {
        Status::bump(&self.status.innernode_add_pivot_num);

        let cmp = &self.options.comparator;
        let idx = core
            .pivots
            .partition_point(|p| cmp.compare(&p.key, &key) == Ordering::Less);

        core.pivots.insert(
            idx,
            Pivot {
                key,
                child,
                msgbuf: Mutex::new(MsgBuf::new(self.options.comparator.clone())),
            },
        );

        self.recount(core);
        self.base.set_dirty(true);
    }

    /// Drops the slot routing to `child`.
    ///
    /// Removing the first child promotes the first pivot into its place;
    /// removing the last child leaves the node childless, which only the
    /// root survives (by collapsing).
    fn rm_pivot_locked(&self, core: &mut RwLockWriteGuard<'_, InnerCore>, child: Bid) {
        Status::bump(&self.status.innernode_rm_pivot_num);

        if core.first_child == child {
            if core.pivots.is_empty() {
                core.first_child = NID_NIL;
                core.first_msgbuf.lock().expect("lock is poisoned").clear();
            } else {
                let promoted = core.pivots.remove(0);
                core.first_child = promoted.child;
                core.first_msgbuf = promoted.msgbuf;
            }
        } else if let Some(idx) = core.pivots.iter().position(|p| p.child == child) {
            core.pivots.remove(idx);
        } else {
            log::warn!(
                "rm_pivot: node {} has no child {child}",
                self.base.nid(),
            );
            return;
        }

        self.recount(core);
        self.base.set_dirty(true);
    }

    /// Point lookup: the freshest state of a key is the first message
    /// found on the way down, so buffers are consulted before children.
    pub(crate) fn find(&self, key: &[u8], tree: &TreeInner) -> crate::Result<Option<Slice>> {
        self.base.touch();

        let core = self.core.read().expect("lock is poisoned");
        let slot = self.slot_of(&core, key);

        {
            let buf = Self::slot_buf(&core, slot).lock().expect("lock is poisoned");
            if let Some(msg) = buf.find(key) {
                return Ok(match msg.op {
                    crate::tree::msg::MsgOp::Put => Some(msg.value.clone()),
                    crate::tree::msg::MsgOp::Del => None,
                });
            }
        }

        let child_nid = Self::slot_child(&core, slot);
        if child_nid == NID_NIL {
            return Ok(None);
        }

        // the read pin stays held while descending, so a concurrent
        // split cannot move the key from under us
        let child = tree.load_node(child_nid, false)?;
        match &*child {
            Node::Leaf(leaf) => Ok(leaf.find(key)),
            Node::Inner(inner) => inner.find(key, tree),
            Node::Schema(_) => unreachable!("schema node cannot be a tree child"),
        }
    }

    fn encoded_size_locked(&self, core: &InnerCore) -> usize {
        let mut size = INNER_HEADER_SIZE;

        for pivot in &core.pivots {
            size += 4 + pivot.key.len() + 8;
        }

        size += core
            .first_msgbuf
            .lock()
            .expect("lock is poisoned")
            .encoded_size();

        for pivot in &core.pivots {
            size += pivot.msgbuf.lock().expect("lock is poisoned").encoded_size();
        }

        size
    }

    pub(crate) fn try_pin(&self) -> bool {
        // a failed try_write means a cascade or split is underway
        self.core.try_write().is_ok()
    }

    #[cfg(test)]
    pub(crate) fn first_child(&self) -> Bid {
        self.core.read().expect("lock is poisoned").first_child
    }

    #[cfg(test)]
    pub(crate) fn first_msgbuf_count(&self) -> usize {
        let core = self.core.read().expect("lock is poisoned");
        let count = core.first_msgbuf.lock().expect("lock is poisoned").count();
        count
    }

    #[cfg(test)]
    pub(crate) fn pivots_snapshot(&self) -> Vec<(Slice, Bid)> {
        let core = self.core.read().expect("lock is poisoned");
        core.pivots
            .iter()
            .map(|p| (p.key.clone(), p.child))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn pivot_msgbuf_count(&self, idx: usize) -> usize {
        let core = self.core.read().expect("lock is poisoned");
        let count = core
            .pivots
            .get(idx)
            .map_or(0, |p| p.msgbuf.lock().expect("lock is poisoned").count());
        count
    }
}

impl NodeOps for InnerNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn size(&self) -> usize {
        // assembled from atomics so cache scans never block on a pin
        INNER_HEADER_SIZE
            + self.pivot_meta_size.load(SeqCst)
            + 4 * (self.pivot_count.load(SeqCst) + 1)
            + self.msg_size.load(SeqCst)
    }

    fn estimated_buffer_size(&self) -> usize {
        self.size()
    }

    fn write_to(&self, out: &mut Vec<u8>) -> crate::Result<usize> {
        // writers mutate slot buffers under the read pin, so
        // serialization needs the write pin to get a stable image
        let core = self.core.write().expect("lock is poisoned");

        out.write_u8(u8::from(core.bottom))?;
        out.write_u64::<BigEndian>(core.first_child)?;

        #[allow(clippy::cast_possible_truncation)]
        out.write_u32::<BigEndian>(core.pivots.len() as u32)?;

        for pivot in &core.pivots {
            encode_slice(out, &pivot.key)?;
            out.write_u64::<BigEndian>(pivot.child)?;
        }

        let skeleton_size = out.len();

        core.first_msgbuf
            .lock()
            .expect("lock is poisoned")
            .encode_into(out)?;

        for pivot in &core.pivots {
            pivot
                .msgbuf
                .lock()
                .expect("lock is poisoned")
                .encode_into(out)?;
        }

        self.base.set_dirty(false);
        Ok(skeleton_size)
    }

    fn read_from(&self, bytes: &[u8], _skeleton_only: bool) -> crate::Result<()> {
        let comparator = self.options.comparator.clone();
        let mut reader = Cursor::new(bytes);

        let mut core = self.core.write().expect("lock is poisoned");
        core.bottom = reader.read_u8()? != 0;
        core.first_child = reader.read_u64::<BigEndian>()?;

        let pivot_count = reader.read_u32::<BigEndian>()?;
        let mut pivots = Vec::with_capacity(pivot_count as usize);
        for _ in 0..pivot_count {
            let key = decode_slice(&mut reader)?;
            let child = reader.read_u64::<BigEndian>()?;
            pivots.push((key, child));
        }

        core.first_msgbuf = Mutex::new(MsgBuf::decode_from(&mut reader, comparator.clone())?);

        core.pivots = pivots
            .into_iter()
            .map(|(key, child)| {
                Ok(Pivot {
                    key,
                    child,
                    msgbuf: Mutex::new(MsgBuf::decode_from(&mut reader, comparator.clone())?),
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        self.recount(&core);
        Ok(())
    }
}
