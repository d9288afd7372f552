// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{decode_slice, encode_slice},
    tree::{
        msg::{Msg, MsgOp},
        node::{CascadeResult, NodeBase, NodeOps, SplitInfo, NID_NIL},
        TreeInner,
    },
    Bid, Options, Slice, Status, TableNo,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    cmp::Ordering,
    io::Cursor,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst},
    sync::{Arc, RwLock},
};

const LEAF_HEADER_SIZE: usize = 8 + 8 + 4;

/// A key/value pair stored in a leaf
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub key: Slice,
    pub value: Slice,
}

impl Record {
    #[must_use]
    pub fn new<K: Into<Slice>, V: Into<Slice>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        4 + self.key.len() + 4 + self.value.len()
    }

    pub fn encode_into<W: std::io::Write>(
        &self,
        writer: &mut W,
    ) -> Result<(), crate::coding::EncodeError> {
        encode_slice(writer, &self.key)?;
        encode_slice(writer, &self.value)?;
        Ok(())
    }

    pub fn decode_from<R: std::io::Read>(
        reader: &mut R,
    ) -> Result<Self, crate::coding::DecodeError> {
        Ok(Self {
            key: decode_slice(reader)?,
            value: decode_slice(reader)?,
        })
    }
}

/// Bottom-level node holding sorted records
///
/// Leaves never buffer anything; the messages a parent cascades down are
/// merged straight into the record list.
pub struct LeafNode {
    base: NodeBase,
    options: Arc<Options>,
    status: Arc<Status>,

    // sibling links are plain atomics so neighbors can be repaired
    // without taking another leaf's record lock
    left_sibling: AtomicU64,
    right_sibling: AtomicU64,

    // mirrored outside the lock so cache size scans never block on a pin
    byte_size: AtomicUsize,

    records: RwLock<Vec<Record>>,
}

impl LeafNode {
    #[must_use]
    pub fn new(tbn: TableNo, nid: Bid, options: Arc<Options>, status: Arc<Status>) -> Self {
        Self {
            base: NodeBase::new(tbn, nid),
            options,
            status,
            left_sibling: AtomicU64::new(NID_NIL),
            right_sibling: AtomicU64::new(NID_NIL),
            byte_size: AtomicUsize::new(0),
            records: RwLock::new(vec![]),
        }
    }

    fn refresh_byte_size(&self, records: &[Record]) {
        self.byte_size
            .store(records.iter().map(Record::size).sum(), SeqCst);
    }

    #[must_use]
    pub fn left_sibling(&self) -> Bid {
        self.left_sibling.load(SeqCst)
    }

    #[must_use]
    pub fn right_sibling(&self) -> Bid {
        self.right_sibling.load(SeqCst)
    }

    pub(crate) fn set_left_sibling(&self, nid: Bid) {
        self.left_sibling.store(nid, SeqCst);
    }

    pub(crate) fn set_right_sibling(&self, nid: Bid) {
        self.right_sibling.store(nid, SeqCst);
    }

    /// Number of records currently stored.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().expect("lock is poisoned").len()
    }

    pub(crate) fn try_pin(&self) -> bool {
        // a failed try_write means a cascade is underway
        self.records.try_write().is_ok()
    }

    /// Looks up a record by key.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<Slice> {
        self.base.touch();
        let records = self.records.read().expect("lock is poisoned");
        let cmp = &self.options.comparator;

        let idx = records.partition_point(|r| cmp.compare(&r.key, key) == Ordering::Less);
        let record = records.get(idx)?;

        if cmp.compare(&record.key, key) == Ordering::Equal {
            Some(record.value.clone())
        } else {
            None
        }
    }

    /// Absorbs a sorted run of messages cascaded down by the parent.
    ///
    /// Puts upsert, deletes drop the record if present. An emptied leaf
    /// marks itself dead and reports upward; an overgrown one splits at
    /// the median and hands the promoted key upward.
    pub(crate) fn cascade(
        &self,
        incoming: Vec<Msg>,
        tree: &TreeInner,
    ) -> crate::Result<CascadeResult> {
        Status::bump(&self.status.leaf_cascade_num);
        self.base.touch();

        let mut records = self.records.write().expect("lock is poisoned");
        let cmp = &self.options.comparator;

        let mut hint = 0;
        for msg in incoming {
            hint += records
                .get(hint..)
                .map_or(0, |rest| {
                    rest.partition_point(|r| cmp.compare(&r.key, &msg.key) == Ordering::Less)
                });

            let exists = records
                .get(hint)
                .is_some_and(|r| cmp.compare(&r.key, &msg.key) == Ordering::Equal);

            match msg.op {
                MsgOp::Put => {
                    let record = Record {
                        key: msg.key,
                        value: msg.value,
                    };

                    if exists {
                        if let Some(slot) = records.get_mut(hint) {
                            *slot = record;
                        }
                    } else {
                        records.insert(hint, record);
                    }
                }
                MsgOp::Del => {
                    if exists {
                        records.remove(hint);
                    }
                }
            }
        }

        self.base.set_dirty(true);
        self.refresh_byte_size(&records);

        let mut result = CascadeResult::default();

        if records.is_empty() {
            Status::bump(&self.status.leaf_merge_num);
            self.base.set_dead();
            drop(records);

            self.unlink_siblings(tree)?;
            result.emptied = true;
            return Ok(result);
        }

        let byte_size: usize = records.iter().map(Record::size).sum();
        if records.len() > self.options.leaf_node_record_count
            || LEAF_HEADER_SIZE + byte_size > self.options.leaf_node_page_size
        {
            result.splits.push(self.split(&mut records, tree)?);
            self.refresh_byte_size(&records);
        }

        Ok(result)
    }

    fn split(
        &self,
        records: &mut Vec<Record>,
        tree: &TreeInner,
    ) -> crate::Result<SplitInfo> {
        Status::bump(&self.status.leaf_split_num);

        let upper = records.split_off(records.len() / 2);
        let promoted = upper
            .first()
            .map(|r| r.key.clone())
            .expect("split halves are never empty");

        let sibling = tree.new_leaf_node()?;
        let Some(new_leaf) = sibling.as_leaf() else {
            unreachable!("leaf factory returned a non-leaf node");
        };

        let old_right = self.right_sibling();

        new_leaf.refresh_byte_size(&upper);
        *new_leaf.records.write().expect("lock is poisoned") = upper;
        new_leaf.set_left_sibling(self.base.nid());
        new_leaf.set_right_sibling(old_right);
        new_leaf.base().set_dirty(true);

        self.set_right_sibling(sibling.nid());

        if old_right != NID_NIL {
            let neighbor = tree.load_node(old_right, false)?;
            if let Some(leaf) = neighbor.as_leaf() {
                leaf.set_left_sibling(sibling.nid());
                leaf.base().set_dirty(true);
            }
        }

        log::trace!(
            "leaf {} split, promoted key {:?}, sibling {}",
            self.base.nid(),
            promoted,
            sibling.nid(),
        );

        Ok(SplitInfo {
            key: promoted,
            sibling: sibling.nid(),
        })
    }

    /// Takes this (dead) leaf out of the sibling chain.
    fn unlink_siblings(&self, tree: &TreeInner) -> crate::Result<()> {
        let left = self.left_sibling();
        let right = self.right_sibling();

        if left != NID_NIL {
            if let Some(leaf) = tree.load_node(left, false)?.as_leaf() {
                leaf.set_right_sibling(right);
                leaf.base().set_dirty(true);
            }
        }

        if right != NID_NIL {
            if let Some(leaf) = tree.load_node(right, false)?.as_leaf() {
                leaf.set_left_sibling(left);
                leaf.base().set_dirty(true);
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn records_snapshot(&self) -> Vec<Record> {
        self.records.read().expect("lock is poisoned").clone()
    }

    #[cfg(test)]
    pub(crate) fn install_records(&self, records: Vec<Record>) {
        self.refresh_byte_size(&records);
        *self.records.write().expect("lock is poisoned") = records;
    }
}

impl NodeOps for LeafNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn size(&self) -> usize {
        LEAF_HEADER_SIZE + self.byte_size.load(SeqCst)
    }

    fn estimated_buffer_size(&self) -> usize {
        self.size()
    }

    fn write_to(&self, out: &mut Vec<u8>) -> crate::Result<usize> {
        // a read lock suffices: all record mutation happens under the
        // write lock, so this excludes concurrent cascades
        let records = self.records.read().expect("lock is poisoned");

        out.write_u64::<BigEndian>(self.left_sibling())?;
        out.write_u64::<BigEndian>(self.right_sibling())?;

        #[allow(clippy::cast_possible_truncation)]
        out.write_u32::<BigEndian>(records.len() as u32)?;

        for record in records.iter() {
            record.encode_into(out)?;
        }

        self.base.set_dirty(false);
        Ok(LEAF_HEADER_SIZE)
    }

    fn read_from(&self, bytes: &[u8], _skeleton_only: bool) -> crate::Result<()> {
        let mut reader = Cursor::new(bytes);

        self.set_left_sibling(reader.read_u64::<BigEndian>()?);
        self.set_right_sibling(reader.read_u64::<BigEndian>()?);

        let count = reader.read_u32::<BigEndian>()?;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            records.push(Record::decode_from(&mut reader)?);
        }

        self.refresh_byte_size(&records);
        *self.records.write().expect("lock is poisoned") = records;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::NID_LEAF_START;
    use test_log::test;

    fn leaf() -> LeafNode {
        LeafNode::new(
            0,
            NID_LEAF_START,
            Arc::new(Options::default()),
            Arc::new(Status::default()),
        )
    }

    #[test]
    fn record_roundtrip() -> crate::Result<()> {
        let record = Record::new("a", "1");

        let mut buf = vec![];
        record.encode_into(&mut buf)?;
        assert_eq!(record.size(), buf.len());

        assert_eq!(record, Record::decode_from(&mut &buf[..])?);
        Ok(())
    }

    #[test]
    fn leaf_find() {
        let leaf = leaf();
        leaf.install_records(vec![
            Record::new("a", "1"),
            Record::new("c", "3"),
            Record::new("e", "5"),
        ]);

        assert_eq!(Some(Slice::from("3")), leaf.find(b"c"));
        assert_eq!(None, leaf.find(b"b"));
        assert_eq!(None, leaf.find(b"f"));
    }

    #[test]
    fn leaf_roundtrip() -> crate::Result<()> {
        let original = leaf();
        original.install_records(vec![Record::new("a", "1"), Record::new("b", "2")]);
        original.set_left_sibling(NID_LEAF_START + 7);

        let mut buf = vec![];
        let skeleton = original.write_to(&mut buf)?;
        assert_eq!(LEAF_HEADER_SIZE, skeleton);
        assert_eq!(original.estimated_buffer_size(), buf.len());

        let copy = leaf();
        copy.read_from(&buf, false)?;

        assert_eq!(original.records_snapshot(), copy.records_snapshot());
        assert_eq!(NID_LEAF_START + 7, copy.left_sibling());
        assert_eq!(NID_NIL, copy.right_sibling());
        Ok(())
    }
}
