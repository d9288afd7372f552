// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{decode_slice, encode_slice, DecodeError, EncodeError},
    Comparator, Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    cmp::Ordering,
    io::{Read, Write},
    sync::Arc,
};

/// Kind of a buffered write
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MsgOp {
    /// Insert or overwrite a record
    Put = 0,

    /// Remove a record
    Del = 1,
}

impl TryFrom<u8> for MsgOp {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Put),
            1 => Ok(Self::Del),
            _ => Err(()),
        }
    }
}

/// A buffered write on its way down the tree
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Msg {
    pub op: MsgOp,
    pub key: Slice,

    /// Empty for [`MsgOp::Del`]
    pub value: Slice,
}

impl Msg {
    #[must_use]
    pub fn put<K: Into<Slice>, V: Into<Slice>>(key: K, value: V) -> Self {
        Self {
            op: MsgOp::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn del<K: Into<Slice>>(key: K) -> Self {
        Self {
            op: MsgOp::Del,
            key: key.into(),
            value: Slice::empty(),
        }
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut sz = 1 + 4 + self.key.len();
        if self.op == MsgOp::Put {
            sz += 4 + self.value.len();
        }
        sz
    }

    pub fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.op as u8)?;
        encode_slice(writer, &self.key)?;
        if self.op == MsgOp::Put {
            encode_slice(writer, &self.value)?;
        }
        Ok(())
    }

    pub fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        let op = MsgOp::try_from(tag).map_err(|()| DecodeError::InvalidTag(("MsgOp", tag)))?;
        let key = decode_slice(reader)?;

        let value = if op == MsgOp::Put {
            decode_slice(reader)?
        } else {
            Slice::empty()
        };

        Ok(Self { op, key, value })
    }
}

/// A sorted, deduplicated buffer of pending writes
///
/// Writing a message whose key is already buffered replaces the older
/// message, so at most one message per key survives ("upsert").
pub struct MsgBuf {
    comparator: Arc<dyn Comparator>,
    msgs: Vec<Msg>,
    size: usize,
}

impl MsgBuf {
    #[must_use]
    pub fn new(comparator: Arc<dyn Comparator>) -> Self {
        Self {
            comparator,
            msgs: vec![],
            size: 0,
        }
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn count(&self) -> usize {
        self.msgs.len()
    }

    /// Sum of the serialized sizes of all buffered messages.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Msg> {
        self.msgs.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Msg> {
        self.msgs.iter()
    }

    /// Index of the first message whose key is not less than `key`.
    #[must_use]
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.msgs
            .partition_point(|m| self.comparator.compare(&m.key, key) == Ordering::Less)
    }

    /// Returns the buffered message for `key`, if any.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<&Msg> {
        let idx = self.lower_bound(key);
        let msg = self.msgs.get(idx)?;

        if self.comparator.compare(&msg.key, key) == Ordering::Equal {
            Some(msg)
        } else {
            None
        }
    }

    /// Buffers a message, replacing any older message with the same key.
    pub fn write(&mut self, msg: Msg) {
        let idx = self.lower_bound(&msg.key);
        self.upsert_at(idx, msg);
    }

    /// Merges a sorted run of messages, preserving upsert semantics.
    ///
    /// The run must be sorted under the same comparator; later messages
    /// win over already-buffered ones.
    pub fn append<I: IntoIterator<Item = Msg>>(&mut self, run: I) {
        let mut hint = 0;

        for msg in run {
            // keys arrive in ascending order, so the insertion point can
            // only move right
            hint += self.msgs.get(hint..).map_or(0, |rest| {
                rest.partition_point(|m| {
                    self.comparator.compare(&m.key, &msg.key) == Ordering::Less
                })
            });

            self.upsert_at(hint, msg);
        }
    }

    fn upsert_at(&mut self, idx: usize, msg: Msg) {
        let replaces = self
            .msgs
            .get(idx)
            .is_some_and(|m| self.comparator.compare(&m.key, &msg.key) == Ordering::Equal);

        if replaces {
            if let Some(slot) = self.msgs.get_mut(idx) {
                self.size -= slot.size();
                self.size += msg.size();
                *slot = msg;
            }
        } else {
            self.size += msg.size();
            self.msgs.insert(idx, msg);
        }
    }

    /// Removes and returns all buffered messages.
    pub fn take(&mut self) -> Vec<Msg> {
        self.size = 0;
        std::mem::take(&mut self.msgs)
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        self.size = 0;
    }

    /// Serialized size: message count plus all messages.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        4 + self.size
    }

    pub fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.msgs.len() as u32)?;

        for msg in &self.msgs {
            msg.encode_into(writer)?;
        }

        Ok(())
    }

    pub fn decode_from<R: Read>(
        reader: &mut R,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self, DecodeError> {
        let count = reader.read_u32::<BigEndian>()?;

        let mut msgs = Vec::with_capacity(count as usize);
        let mut size = 0;

        for _ in 0..count {
            let msg = Msg::decode_from(reader)?;
            size += msg.size();
            msgs.push(msg);
        }

        Ok(Self {
            comparator,
            msgs,
            size,
        })
    }
}

impl std::fmt::Debug for MsgBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MsgBuf({} msgs, {} bytes)", self.count(), self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::LexicalComparator;
    use test_log::test;

    fn msgbuf() -> MsgBuf {
        MsgBuf::new(Arc::new(LexicalComparator))
    }

    #[test]
    fn msg_size() {
        assert_eq!(1 + 4 + 1 + 4 + 1, Msg::put("a", "1").size());
        assert_eq!(1 + 4 + 3, Msg::del("abc").size());
    }

    #[test]
    fn msg_roundtrip() -> Result<(), DecodeError> {
        for msg in [Msg::put("key", "value"), Msg::del("key")] {
            let mut buf = vec![];
            msg.encode_into(&mut buf).expect("serialization should work");
            assert_eq!(msg.size(), buf.len());
            assert_eq!(msg, Msg::decode_from(&mut &buf[..])?);
        }
        Ok(())
    }

    #[test]
    fn msgbuf_sorted_insert() {
        let mut buf = msgbuf();
        buf.write(Msg::put("c", "1"));
        buf.write(Msg::put("a", "1"));
        buf.write(Msg::put("b", "1"));

        let keys: Vec<_> = buf.iter().map(|m| m.key.clone()).collect();
        assert_eq!(
            vec![Slice::from("a"), Slice::from("b"), Slice::from("c")],
            keys
        );
        assert_eq!(3 * Msg::put("a", "1").size(), buf.size());
    }

    #[test]
    fn msgbuf_upsert_keeps_latest() {
        let mut buf = msgbuf();
        buf.write(Msg::put("k", "old"));
        buf.write(Msg::put("a", "1"));
        buf.write(Msg::put("k", "newer"));

        assert_eq!(2, buf.count());

        let msg = buf.find(b"k").expect("should be buffered");
        assert_eq!(MsgOp::Put, msg.op);
        assert_eq!(b"newer", &*msg.value);

        let expected = Msg::put("a", "1").size() + Msg::put("k", "newer").size();
        assert_eq!(expected, buf.size());
    }

    #[test]
    fn msgbuf_del_shadows_put() {
        let mut buf = msgbuf();
        buf.write(Msg::put("k", "v"));
        buf.write(Msg::del("k"));

        assert_eq!(1, buf.count());
        assert_eq!(MsgOp::Del, buf.find(b"k").expect("should be buffered").op);
    }

    #[test]
    fn msgbuf_append_merges_sorted_run() {
        let mut buf = msgbuf();
        buf.write(Msg::put("b", "1"));
        buf.write(Msg::put("d", "1"));

        buf.append([Msg::put("a", "2"), Msg::put("b", "2"), Msg::put("e", "2")]);

        assert_eq!(4, buf.count());
        let keys: Vec<_> = buf.iter().map(|m| m.key.clone()).collect();
        assert_eq!(
            vec![
                Slice::from("a"),
                Slice::from("b"),
                Slice::from("d"),
                Slice::from("e"),
            ],
            keys
        );
        assert_eq!(b"2", &*buf.find(b"b").expect("should be buffered").value);

        let expected: usize = buf.iter().map(Msg::size).sum();
        assert_eq!(expected, buf.size());
    }

    #[test]
    fn msgbuf_roundtrip() -> Result<(), DecodeError> {
        let mut buf = msgbuf();
        buf.write(Msg::put("a", "1"));
        buf.write(Msg::del("b"));
        buf.write(Msg::put("c", "3"));

        let mut bytes = vec![];
        buf.encode_into(&mut bytes).expect("serialization should work");
        assert_eq!(buf.encoded_size(), bytes.len());

        let decoded = MsgBuf::decode_from(&mut &bytes[..], Arc::new(LexicalComparator))?;
        assert_eq!(3, decoded.count());
        assert_eq!(buf.size(), decoded.size());
        assert_eq!(MsgOp::Del, decoded.find(b"b").expect("should exist").op);
        Ok(())
    }

    #[test]
    fn msgbuf_take_resets() {
        let mut buf = msgbuf();
        buf.write(Msg::put("a", "1"));

        let run = buf.take();
        assert_eq!(1, run.len());
        assert!(buf.is_empty());
        assert_eq!(0, buf.size());
    }
}
