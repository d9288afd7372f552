// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    tree::{inner::InnerNode, leaf::LeafNode},
    Bid, Slice, TableNo,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use enum_dispatch::enum_dispatch;
use std::{
    io::Cursor,
    sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
    sync::RwLock,
};

/// The nil node id; no node ever carries it
pub const NID_NIL: Bid = 0;

/// The id of each tree's schema node
pub const NID_SCHEMA: Bid = 1;

/// First inner node id
pub const NID_START: Bid = 2;

/// First leaf node id; leaves occupy the upper id range so the id alone
/// tells leaves and inner nodes apart
pub const NID_LEAF_START: Bid = 1 << 48;

/// Returns `true` if the id addresses a leaf node.
#[must_use]
pub fn is_leaf_nid(nid: Bid) -> bool {
    nid >= NID_LEAF_START
}

pub(crate) fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

/// Identity and lifecycle flags shared by every node
pub struct NodeBase {
    tbn: TableNo,
    nid: Bid,
    dirty: AtomicBool,
    flushing: AtomicBool,
    dead: AtomicBool,
    first_write_at_us: AtomicU64,
    last_used_at_us: AtomicU64,
}

impl NodeBase {
    #[must_use]
    pub fn new(tbn: TableNo, nid: Bid) -> Self {
        Self {
            tbn,
            nid,
            dirty: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            first_write_at_us: AtomicU64::new(0),
            last_used_at_us: AtomicU64::new(now_micros()),
        }
    }

    #[must_use]
    pub fn tbn(&self) -> TableNo {
        self.tbn
    }

    #[must_use]
    pub fn nid(&self) -> Bid {
        self.nid
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(SeqCst)
    }

    /// Marks the node dirty or clean; the first transition from clean to
    /// dirty stamps the write timestamp the flusher orders by.
    pub fn set_dirty(&self, dirty: bool) {
        if dirty {
            if !self.dirty.swap(true, SeqCst) {
                self.first_write_at_us.store(now_micros(), SeqCst);
            }
        } else {
            self.dirty.store(false, SeqCst);
        }
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(SeqCst)
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, SeqCst);
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(SeqCst)
    }

    pub fn set_dead(&self) {
        self.dead.store(true, SeqCst);
    }

    #[must_use]
    pub fn first_write_at_us(&self) -> u64 {
        self.first_write_at_us.load(SeqCst)
    }

    #[must_use]
    pub fn last_used_at_us(&self) -> u64 {
        self.last_used_at_us.load(SeqCst)
    }

    /// Stamps the LRU timestamp.
    pub fn touch(&self) {
        self.last_used_at_us.store(now_micros(), SeqCst);
    }
}

/// Behavior common to all node kinds, dispatched over [`Node`]
#[enum_dispatch]
pub trait NodeOps {
    /// Identity and lifecycle flags.
    fn base(&self) -> &NodeBase;

    /// Approximate in-memory footprint in bytes, used for cache accounting.
    fn size(&self) -> usize;

    /// Upper bound of the serialized size, computed before serialization
    /// so the layout can allocate a block.
    fn estimated_buffer_size(&self) -> usize;

    /// Serializes the node into `out` and marks it clean in the same
    /// step, so writes racing with the flush re-dirty it afterwards.
    ///
    /// Returns the skeleton size (the structural prefix).
    fn write_to(&self, out: &mut Vec<u8>) -> crate::Result<usize>;

    /// Deserializes a block produced by [`NodeOps::write_to`].
    fn read_from(&self, bytes: &[u8], skeleton_only: bool) -> crate::Result<()>;
}

/// A cached tree node
#[enum_dispatch(NodeOps)]
pub enum Node {
    Schema(SchemaNode),
    Inner(InnerNode),
    Leaf(LeafNode),
}

impl Node {
    #[must_use]
    pub fn tbn(&self) -> TableNo {
        self.base().tbn()
    }

    #[must_use]
    pub fn nid(&self) -> Bid {
        self.base().nid()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.base().is_dirty()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.base().set_dirty(dirty);
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.base().is_flushing()
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.base().set_flushing(flushing);
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.base().is_dead()
    }

    pub fn set_dead(&self) {
        self.base().set_dead();
    }

    #[must_use]
    pub fn as_inner(&self) -> Option<&InnerNode> {
        match self {
            Self::Inner(node) => Some(node),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Self::Leaf(node) => Some(node),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_schema(&self) -> Option<&SchemaNode> {
        match self {
            Self::Schema(node) => Some(node),
            _ => None,
        }
    }

    /// Probes whether the node can be flushed right now: nobody may hold
    /// a structural (write) pin. On success the node is flagged as
    /// flushing.
    #[must_use]
    pub fn try_pin_flush(&self) -> bool {
        let pinned = match self {
            Self::Schema(node) => node.try_pin(),
            Self::Inner(node) => node.try_pin(),
            Self::Leaf(node) => node.try_pin(),
        };

        if pinned {
            self.set_flushing(true);
        }

        pinned
    }
}

/// The key with the new sibling's id, handed upward after a split so the
/// parent can add a pivot
pub(crate) struct SplitInfo {
    pub key: Slice,
    pub sibling: Bid,
}

/// What a cascade did to the child, applied by the parent under its own
/// pin before it lets go
#[derive(Default)]
pub(crate) struct CascadeResult {
    pub splits: Vec<SplitInfo>,
    pub emptied: bool,
}

/// Per-tree bookkeeping node, stored at [`NID_SCHEMA`]
pub struct SchemaNode {
    base: NodeBase,
    core: RwLock<SchemaCore>,
    next_inner_node_id: AtomicU64,
    next_leaf_node_id: AtomicU64,
}

struct SchemaCore {
    root_node_id: Bid,
    tree_depth: u32,
}

impl SchemaNode {
    /// Creates the schema of a fresh, empty tree.
    #[must_use]
    pub fn new(tbn: TableNo) -> Self {
        Self {
            base: NodeBase::new(tbn, NID_SCHEMA),
            core: RwLock::new(SchemaCore {
                root_node_id: NID_NIL,
                tree_depth: 2,
            }),
            next_inner_node_id: AtomicU64::new(NID_START),
            next_leaf_node_id: AtomicU64::new(NID_LEAF_START),
        }
    }

    #[must_use]
    pub fn root_node_id(&self) -> Bid {
        self.core.read().expect("lock is poisoned").root_node_id
    }

    pub fn set_root_node_id(&self, nid: Bid) {
        self.core.write().expect("lock is poisoned").root_node_id = nid;
    }

    #[must_use]
    pub fn tree_depth(&self) -> u32 {
        self.core.read().expect("lock is poisoned").tree_depth
    }

    pub fn incr_tree_depth(&self) {
        self.core.write().expect("lock is poisoned").tree_depth += 1;
    }

    pub fn reset_tree_depth(&self) {
        self.core.write().expect("lock is poisoned").tree_depth = 2;
    }

    /// Hands out the next inner node id.
    pub fn next_inner_node_id(&self) -> Bid {
        self.next_inner_node_id.fetch_add(1, SeqCst)
    }

    /// Hands out the next leaf node id.
    pub fn next_leaf_node_id(&self) -> Bid {
        self.next_leaf_node_id.fetch_add(1, SeqCst)
    }

    pub(crate) fn try_pin(&self) -> bool {
        // the schema has no structural pins; serialization reads atomics
        // and the small core, both safe alongside id allocation
        true
    }
}

impl NodeOps for SchemaNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn size(&self) -> usize {
        self.estimated_buffer_size()
    }

    fn estimated_buffer_size(&self) -> usize {
        8 + 8 + 8 + 4
    }

    fn write_to(&self, out: &mut Vec<u8>) -> crate::Result<usize> {
        let core = self.core.write().expect("lock is poisoned");

        out.write_u64::<BigEndian>(core.root_node_id)?;
        out.write_u64::<BigEndian>(self.next_inner_node_id.load(SeqCst))?;
        out.write_u64::<BigEndian>(self.next_leaf_node_id.load(SeqCst))?;
        out.write_u32::<BigEndian>(core.tree_depth)?;

        self.base.set_dirty(false);
        Ok(out.len())
    }

    fn read_from(&self, bytes: &[u8], _skeleton_only: bool) -> crate::Result<()> {
        let mut reader = Cursor::new(bytes);

        let mut core = self.core.write().expect("lock is poisoned");
        core.root_node_id = reader.read_u64::<BigEndian>()?;

        self.next_inner_node_id
            .store(reader.read_u64::<BigEndian>()?, SeqCst);
        self.next_leaf_node_id
            .store(reader.read_u64::<BigEndian>()?, SeqCst);

        core.tree_depth = reader.read_u32::<BigEndian>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn nid_ranges() {
        assert!(!is_leaf_nid(NID_START));
        assert!(!is_leaf_nid(NID_LEAF_START - 1));
        assert!(is_leaf_nid(NID_LEAF_START));
        assert!(is_leaf_nid(NID_LEAF_START + 1_000));
    }

    #[test]
    fn schema_fresh_defaults() {
        let schema = SchemaNode::new(0);
        assert_eq!(NID_NIL, schema.root_node_id());
        assert_eq!(2, schema.tree_depth());
        assert_eq!(NID_START, schema.next_inner_node_id());
        assert_eq!(NID_START + 1, schema.next_inner_node_id());
        assert_eq!(NID_LEAF_START, schema.next_leaf_node_id());
    }

    #[test]
    fn schema_roundtrip() -> crate::Result<()> {
        let schema = SchemaNode::new(0);
        schema.set_root_node_id(NID_START);
        schema.incr_tree_depth();
        let _ = schema.next_inner_node_id();
        let _ = schema.next_leaf_node_id();

        let mut buf = vec![];
        schema.write_to(&mut buf)?;

        let copy = SchemaNode::new(0);
        copy.read_from(&buf, false)?;

        assert_eq!(NID_START, copy.root_node_id());
        assert_eq!(3, copy.tree_depth());
        assert_eq!(NID_START + 1, copy.next_inner_node_id());
        assert_eq!(NID_LEAF_START + 1, copy.next_leaf_node_id());
        Ok(())
    }

    #[test]
    fn dirty_transition_stamps_first_write() {
        let base = NodeBase::new(0, NID_START);
        assert_eq!(0, base.first_write_at_us());

        base.set_dirty(true);
        let stamp = base.first_write_at_us();
        assert!(stamp > 0);

        // re-dirtying while already dirty keeps the original stamp
        base.set_dirty(true);
        assert_eq!(stamp, base.first_write_at_us());

        base.set_dirty(false);
        base.set_dirty(true);
        assert!(base.first_write_at_us() >= stamp);
    }
}
