// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The buffered B-tree.
//!
//! Roughly a B+-tree, except every inner node carries one message buffer
//! per child. A write reaches the root's buffer and returns immediately;
//! when a buffer fills up it is flushed to the buffers among the
//! children ("cascade"), so multiple buffered writes complete in a
//! single batch and finally arrive at the leaves. Structural
//! modifications (split, pile-up, collapse) work like in a traditional
//! B+-tree.

pub(crate) mod inner;
pub(crate) mod leaf;
pub(crate) mod msg;
pub(crate) mod node;

use crate::{
    cache::{Cache, NodeFactory},
    layout::Layout,
    tree::{
        inner::InnerNode,
        leaf::LeafNode,
        msg::Msg,
        node::{is_leaf_nid, Node, SchemaNode, SplitInfo, NID_NIL, NID_SCHEMA},
    },
    Bid, Options, Slice, Status, TableNo,
};
use std::sync::{Arc, RwLock};

/// One ordered key/value namespace
///
/// Cloning is cheap; all clones share the same tree.
#[derive(Clone)]
pub struct Tree(pub(crate) Arc<TreeInner>);

impl Tree {
    /// Opens a tree on a layout, registering it with the cache.
    ///
    /// Loads the schema node from the layout or seeds a fresh one, then
    /// materializes the root.
    pub fn open(
        tbn: TableNo,
        options: Arc<Options>,
        status: Arc<Status>,
        cache: Arc<Cache>,
        layout: Arc<dyn Layout>,
    ) -> crate::Result<Self> {
        let inner = Arc::new(TreeInner {
            tbn,
            options: options.clone(),
            status: status.clone(),
            cache: cache.clone(),
            layout,
            schema: RwLock::new(None),
            root: RwLock::new(None),
        });

        let tree = Self(inner.clone());

        let factory = Arc::new(TreeNodeFactory {
            tbn,
            options,
            status,
        });

        cache.add_table(tbn, factory, inner.layout.clone(), tree.clone())?;
        inner.init()?;

        Ok(tree)
    }

    /// Buffers a write for `key`.
    pub fn put<K: Into<Slice>, V: Into<Slice>>(&self, key: K, value: V) -> crate::Result<()> {
        self.0.put(Msg::put(key, value))
    }

    /// Buffers a delete for `key`.
    pub fn del<K: Into<Slice>>(&self, key: K) -> crate::Result<()> {
        self.0.put(Msg::del(key))
    }

    /// Point lookup.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<Slice>> {
        self.0.get(key.as_ref())
    }

    /// Flushes all dirty nodes of this tree and takes a checkpoint.
    pub fn flush(&self) -> crate::Result<()> {
        self.0.cache.flush_table(self.0.tbn)
    }

    /// Current tree depth (2 for an empty tree).
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.0.schema().tree_depth()
    }

    /// Flushes and deregisters the tree from the cache.
    pub(crate) fn close(&self) -> crate::Result<()> {
        // flush while we still hold root and schema, then let go of them
        // before the cache destroys the table's nodes
        self.0.cache.flush_table(self.0.tbn)?;

        *self.0.root.write().expect("lock is poisoned") = None;
        *self.0.schema.write().expect("lock is poisoned") = None;

        self.0.cache.del_table(self.0.tbn, false)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &TreeInner {
        &self.0
    }
}

pub(crate) struct TreeInner {
    tbn: TableNo,
    options: Arc<Options>,
    status: Arc<Status>,
    cache: Arc<Cache>,
    layout: Arc<dyn Layout>,

    /// Schema node; set once during init
    schema: RwLock<Option<Arc<Node>>>,

    /// Current root; swapped by pileup/collapse
    root: RwLock<Option<Arc<Node>>>,
}

impl TreeInner {
    fn init(&self) -> crate::Result<()> {
        let schema = match self.cache.get(self.tbn, NID_SCHEMA, false) {
            Ok(node) => node,
            Err(crate::Error::BlockNotFound(_)) => {
                log::info!("schema node doesn't exist, init empty db");

                let node = Arc::new(Node::Schema(SchemaNode::new(self.tbn)));
                node.set_dirty(true);
                self.cache.put(self.tbn, NID_SCHEMA, node.clone())?;
                node
            }
            Err(e) => return Err(e),
        };

        *self.schema.write().expect("lock is poisoned") = Some(schema.clone());

        let root_nid = self.schema().root_node_id();
        let root = if root_nid == NID_NIL {
            log::info!("root node doesn't exist, init empty");

            let root = self.new_inner_node()?;
            root.as_inner()
                .expect("factory returns inner nodes for inner ids")
                .init_empty_root();

            self.schema().set_root_node_id(root.nid());
            schema.set_dirty(true);
            root
        } else {
            self.load_node(root_nid, false)?
        };

        *self.root.write().expect("lock is poisoned") = Some(root);
        Ok(())
    }

    fn schema_node(&self) -> Arc<Node> {
        self.schema
            .read()
            .expect("lock is poisoned")
            .clone()
            .expect("tree is initialized")
    }

    fn schema(&self) -> SchemaRef {
        SchemaRef(self.schema_node())
    }

    fn root_node(&self) -> Arc<Node> {
        self.root
            .read()
            .expect("lock is poisoned")
            .clone()
            .expect("tree is initialized")
    }

    pub(crate) fn put(&self, msg: Msg) -> crate::Result<()> {
        let root = self.root_node();
        root.as_inner()
            .expect("the root is always an inner node")
            .put(msg, self)
    }

    pub(crate) fn get(&self, key: &[u8]) -> crate::Result<Option<Slice>> {
        let root = self.root_node();
        root.as_inner()
            .expect("the root is always an inner node")
            .find(key, self)
    }

    /// Allocates and registers a fresh inner node.
    pub(crate) fn new_inner_node(&self) -> crate::Result<Arc<Node>> {
        Status::bump(&self.status.innernode_created_num);

        let schema = self.schema_node();
        let nid = self.schema().next_inner_node_id();
        schema.set_dirty(true);

        let node = Arc::new(Node::Inner(InnerNode::new(
            self.tbn,
            nid,
            self.options.clone(),
            self.status.clone(),
        )));

        self.cache.put(self.tbn, nid, node.clone())?;
        Ok(node)
    }

    /// Allocates and registers a fresh leaf node.
    pub(crate) fn new_leaf_node(&self) -> crate::Result<Arc<Node>> {
        Status::bump(&self.status.leaf_created_num);

        let schema = self.schema_node();
        let nid = self.schema().next_leaf_node_id();
        schema.set_dirty(true);

        let node = Arc::new(Node::Leaf(LeafNode::new(
            self.tbn,
            nid,
            self.options.clone(),
            self.status.clone(),
        )));

        self.cache.put(self.tbn, nid, node.clone())?;
        Ok(node)
    }

    /// Resolves a child by id through the cache.
    pub(crate) fn load_node(&self, nid: Bid, skeleton_only: bool) -> crate::Result<Arc<Node>> {
        debug_assert!(nid != NID_NIL && nid != NID_SCHEMA, "not a data node: {nid}");
        self.cache.get(self.tbn, nid, skeleton_only)
    }

    /// Grows the tree: a new root adopts the split root and its new
    /// sibling. This is the only way tree depth grows.
    pub(crate) fn pileup(&self, old_root: Bid, promoted: SplitInfo) -> crate::Result<()> {
        Status::bump(&self.status.tree_pileup_num);

        let new_root = self.new_inner_node()?;
        new_root
            .as_inner()
            .expect("factory returns inner nodes for inner ids")
            .pileup_from(old_root, promoted);

        let schema = self.schema_node();
        self.schema().set_root_node_id(new_root.nid());
        self.schema().incr_tree_depth();
        schema.set_dirty(true);

        log::info!("tree pileup, root nid {}", new_root.nid());

        *self.root.write().expect("lock is poisoned") = Some(new_root);
        Ok(())
    }

    /// Shrinks the tree: a depleted root is replaced with a fresh empty
    /// one and the depth resets.
    pub(crate) fn collapse(&self) -> crate::Result<()> {
        Status::bump(&self.status.tree_collapse_num);

        let old_root = self.root_node();
        old_root.set_dead();

        let new_root = self.new_inner_node()?;
        new_root
            .as_inner()
            .expect("factory returns inner nodes for inner ids")
            .init_empty_root();

        let schema = self.schema_node();
        self.schema().set_root_node_id(new_root.nid());
        self.schema().reset_tree_depth();
        schema.set_dirty(true);

        log::info!("tree collapse, root nid {}", new_root.nid());

        *self.root.write().expect("lock is poisoned") = Some(new_root);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn root_for_test(&self) -> Arc<Node> {
        self.root_node()
    }
}

/// Borrow-friendly view of the schema node
struct SchemaRef(Arc<Node>);

impl std::ops::Deref for SchemaRef {
    type Target = SchemaNode;

    fn deref(&self) -> &Self::Target {
        self.0
            .as_schema()
            .expect("schema slot always holds a schema node")
    }
}

/// Builds nodes for the cache's miss path, picking the node kind from
/// the id range.
pub(crate) struct TreeNodeFactory {
    tbn: TableNo,
    options: Arc<Options>,
    status: Arc<Status>,
}

impl NodeFactory for TreeNodeFactory {
    fn new_node(&self, nid: Bid) -> Node {
        if nid == NID_SCHEMA {
            Node::Schema(SchemaNode::new(self.tbn))
        } else if is_leaf_nid(nid) {
            Node::Leaf(LeafNode::new(
                self.tbn,
                nid,
                self.options.clone(),
                self.status.clone(),
            ))
        } else {
            Node::Inner(InnerNode::new(
                self.tbn,
                nid,
                self.options.clone(),
                self.status.clone(),
            ))
        }
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::{
        layout::BlockLayout,
        log::LogMgr,
        store::{Directory, RamDirectory},
        tree::node::{NID_LEAF_START, NID_START},
    };
    use test_log::test;

    struct Fixture {
        tree: Tree,
        status: Arc<Status>,
        #[allow(dead_code)]
        cache: Arc<Cache>,
        #[allow(dead_code)]
        dir: Arc<RamDirectory>,
    }

    // tiny structural limits so a handful of keys already forces
    // cascades and splits
    fn fixture() -> Fixture {
        let options = Arc::new(Options {
            inner_node_msg_count: 4,
            inner_node_children_number: 2,
            leaf_node_record_count: 4,
            ..Options::default()
        });

        let status = Arc::new(Status::default());
        let dir = Arc::new(RamDirectory::new());

        let file = dir
            .open_random_access_file("tree_test.cdb")
            .expect("ram file");
        let layout = Arc::new(BlockLayout::new(file, &options, status.clone()));
        layout.init(true).expect("layout init");

        let logmgr = Arc::new(LogMgr::new(options.clone(), None));
        LogMgr::init(&logmgr).expect("logmgr init");

        let cache = Arc::new(Cache::new(options.clone(), status.clone(), logmgr));
        cache.init().expect("cache init");

        let tree =
            Tree::open(0, options, status.clone(), cache.clone(), layout).expect("tree open");

        Fixture {
            tree,
            status,
            cache,
            dir,
        }
    }

    fn leaf_keys(node: &Arc<Node>) -> Vec<Vec<u8>> {
        node.as_leaf()
            .expect("should be a leaf")
            .records_snapshot()
            .iter()
            .map(|r| r.key.to_vec())
            .collect()
    }

    fn check_value(tree: &Tree, key: &str, expected: &str) {
        assert_eq!(
            Some(Slice::from(expected)),
            tree.get(key).expect("get should not fail"),
            "value mismatch for key {key}",
        );
    }

    #[test]
    fn tree_bootstrap() -> crate::Result<()> {
        let fx = fixture();
        let tree = &fx.tree;

        let root = tree.inner().root_for_test();
        let n1 = root.as_inner().expect("root is inner");
        assert_eq!(NID_START, root.nid());

        // first three writes stay in the root's buffer
        tree.put("a", "1")?;
        tree.put("b", "1")?;
        tree.put("c", "1")?;
        assert_eq!(NID_NIL, n1.first_child());
        assert_eq!(3, n1.first_msgbuf_count());
        check_value(tree, "a", "1");

        // the 4th write fills the buffer; the first leaf materializes
        tree.put("d", "1")?;
        assert_eq!(1, fx.status.leaf_created_num());
        assert_eq!(0, n1.first_msgbuf_count());
        assert_ne!(NID_NIL, n1.first_child());

        let l1 = tree.inner().load_node(n1.first_child(), false)?;
        assert_eq!(NID_LEAF_START, l1.nid());
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()], leaf_keys(&l1));

        // go on filling the buffer towards leaf #1
        tree.put("e", "1")?;
        tree.put("f", "1")?;
        tree.put("g", "1")?;
        assert_eq!(3, n1.first_msgbuf_count());

        // cascading into leaf #1 splits it in two
        tree.put("h", "1")?;
        assert_eq!(1, fx.status.leaf_split_num());
        assert_eq!(2, fx.status.leaf_created_num());
        assert_eq!(0, n1.first_msgbuf_count());
        assert_eq!(l1.nid(), n1.first_child());

        let pivots = n1.pivots_snapshot();
        assert_eq!(1, pivots.len());
        assert_eq!(Slice::from("e"), pivots[0].0);

        let l2 = tree.inner().load_node(pivots[0].1, false)?;
        assert_eq!(NID_LEAF_START + 1, l2.nid());
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()], leaf_keys(&l1));
        assert_eq!(vec![b"e".to_vec(), b"f".to_vec(), b"g".to_vec(), b"h".to_vec()], leaf_keys(&l2));

        Ok(())
    }

    #[test]
    fn tree_pileup_grows_depth() -> crate::Result<()> {
        let fx = fixture();
        let tree = &fx.tree;

        // reach the two-leaf state of the bootstrap test
        for key in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            tree.put(key, "1")?;
        }

        let old_root = tree.inner().root_for_test();
        let n1 = old_root.as_inner().expect("root is inner");
        assert_eq!(2, tree.depth());

        // leaf #1 splits again and the root piles up
        tree.put("a", "2")?;
        tree.put("b", "2")?;
        tree.put("bb", "1")?;
        tree.put("e", "2")?;

        assert_eq!(1, fx.status.tree_pileup_num());
        assert_eq!(3, tree.depth());

        // node #3, the new root, adopts the split halves of the old one
        let root = tree.inner().root_for_test();
        assert_ne!(root.nid(), old_root.nid());
        let n3 = root.as_inner().expect("root is inner");
        assert_eq!(NID_START + 2, root.nid());
        assert_eq!(old_root.nid(), n3.first_child());
        assert_eq!(0, n3.first_msgbuf_count());

        // the old root kept the lower half
        assert_eq!(0, n1.first_msgbuf_count());
        let n1_pivots = n1.pivots_snapshot();
        assert_eq!(1, n1_pivots.len());
        assert_eq!(Slice::from("bb"), n1_pivots[0].0);

        let l1 = tree.inner().load_node(n1.first_child(), false)?;
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec()], leaf_keys(&l1));
        let l3 = tree.inner().load_node(n1_pivots[0].1, false)?;
        assert_eq!(NID_LEAF_START + 2, l3.nid());
        assert_eq!(vec![b"bb".to_vec(), b"c".to_vec(), b"d".to_vec()], leaf_keys(&l3));

        // node #2 carried its buffered write along with the split
        let n3_pivots = n3.pivots_snapshot();
        assert_eq!(1, n3_pivots.len());
        assert_eq!(Slice::from("e"), n3_pivots[0].0);

        let n2 = tree.inner().load_node(n3_pivots[0].1, false)?;
        assert_eq!(NID_START + 1, n2.nid());
        let n2_inner = n2.as_inner().expect("inner node");
        assert_eq!(1, n2_inner.first_msgbuf_count());
        assert!(n2_inner.pivots_snapshot().is_empty());

        check_value(tree, "a", "2");
        check_value(tree, "bb", "1");
        check_value(tree, "e", "2");
        check_value(tree, "h", "1");

        Ok(())
    }

    #[test]
    fn tree_cascade_through_two_levels() -> crate::Result<()> {
        let fx = fixture();
        let tree = &fx.tree;

        for key in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            tree.put(key, "1")?;
        }
        tree.put("a", "2")?;
        tree.put("b", "2")?;
        tree.put("bb", "1")?;
        tree.put("e", "2")?;

        let root = tree.inner().root_for_test();
        let n3 = root.as_inner().expect("root is inner");
        let n1 = tree.inner().load_node(n3.first_child(), false)?;
        let n1_inner = n1.as_inner().expect("inner node");

        // cascading down one level, no split
        tree.put("abc", "1")?;
        tree.put("bb", "2")?;
        tree.put("ee", "1")?;
        tree.put("f", "2")?;

        assert_eq!(tree.inner().root_for_test().nid(), root.nid());
        assert_eq!(0, n3.first_msgbuf_count());
        assert_eq!(2, n3.pivot_msgbuf_count(0));
        assert_eq!(1, n1_inner.first_msgbuf_count());
        assert_eq!(1, n1_inner.pivot_msgbuf_count(0));

        // another round cascades into node #2 and splits leaf #2
        tree.put("abcd", "1")?;
        tree.put("g", "2")?;

        assert_eq!(1, n3.first_msgbuf_count());
        assert_eq!(0, n3.pivot_msgbuf_count(0));

        let n3_pivots = n3.pivots_snapshot();
        let n2 = tree.inner().load_node(n3_pivots[0].1, false)?;
        let n2_inner = n2.as_inner().expect("inner node");
        assert_eq!(0, n2_inner.first_msgbuf_count());

        let n2_pivots = n2_inner.pivots_snapshot();
        assert_eq!(1, n2_pivots.len());
        assert_eq!(Slice::from("f"), n2_pivots[0].0);

        let l2 = tree.inner().load_node(n2_inner.first_child(), false)?;
        assert_eq!(vec![b"e".to_vec(), b"ee".to_vec()], leaf_keys(&l2));
        let l4 = tree.inner().load_node(n2_pivots[0].1, false)?;
        assert_eq!(NID_LEAF_START + 3, l4.nid());
        assert_eq!(vec![b"f".to_vec(), b"g".to_vec(), b"h".to_vec()], leaf_keys(&l4));

        check_value(tree, "f", "2");
        check_value(tree, "g", "2");
        check_value(tree, "h", "1");
        check_value(tree, "abcd", "1");

        Ok(())
    }

    #[test]
    fn tree_delete_to_empty_collapses() -> crate::Result<()> {
        let fx = fixture();
        let tree = &fx.tree;

        let keys = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l"];
        for key in keys {
            tree.put(key, "1")?;
        }
        assert!(fx.status.leaf_split_num() > 0);

        // tombstones only move down when buffers overflow, so pad each
        // round with distinct neighboring deletes until the last leaf
        // is gone and the root gives up
        let mut round = 0;
        while fx.status.tree_collapse_num() == 0 && round < 50 {
            for key in keys {
                tree.del(key)?;
                tree.del(format!("{key}{round}"))?;
            }
            round += 1;
        }

        for key in keys {
            assert_eq!(None, tree.get(key)?, "key {key} should be gone");
        }

        assert!(fx.status.leaf_merge_num() > 0);
        assert!(fx.status.tree_collapse_num() >= 1);
        assert_eq!(2, tree.depth());

        Ok(())
    }

    #[test]
    fn tree_reopens_from_layout() -> crate::Result<()> {
        let options = Arc::new(Options {
            inner_node_msg_count: 4,
            inner_node_children_number: 2,
            leaf_node_record_count: 4,
            ..Options::default()
        });

        let status = Arc::new(Status::default());
        let dir = Arc::new(RamDirectory::new());

        {
            let file = dir.open_random_access_file("tree_test.cdb")?;
            let layout = Arc::new(BlockLayout::new(file, &options, status.clone()));
            layout.init(true)?;

            let logmgr = Arc::new(LogMgr::new(options.clone(), None));
            LogMgr::init(&logmgr)?;
            let cache = Arc::new(Cache::new(options.clone(), status.clone(), logmgr));
            cache.init()?;

            let tree = Tree::open(0, options.clone(), status.clone(), cache.clone(), layout)?;
            for key in ["a", "b", "c", "d", "e", "f", "g", "h"] {
                tree.put(key, "1")?;
            }

            tree.close()?;
        }

        {
            let file = dir.open_random_access_file("tree_test.cdb")?;
            let layout = Arc::new(BlockLayout::new(file, &options, status.clone()));
            layout.init(false)?;

            let logmgr = Arc::new(LogMgr::new(options.clone(), None));
            LogMgr::init(&logmgr)?;
            let cache = Arc::new(Cache::new(options.clone(), status.clone(), logmgr));
            cache.init()?;

            let tree = Tree::open(0, options.clone(), status, cache.clone(), layout)?;
            for key in ["a", "b", "c", "d", "e", "f", "g", "h"] {
                check_value(&tree, key, "1");
            }
        }

        Ok(())
    }
}
