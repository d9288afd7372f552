// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded write-optimized key/value storage engine built around a
//! buffered B-tree (a.k.a. Bε-tree / fractal tree).
//!
//! ##### About
//!
//! A buffered B-tree is an on-disk B+-tree whose inner nodes carry one
//! message buffer per child. Writes land in the root's buffer and
//! return immediately; buffers cascade downward only when they
//! overflow, so many random writes complete in a few large sequential
//! node flushes.
//!
//! Three subsystems cooperate to make this crash safe:
//!
//! - the tree itself (cascading buffers, splits, pile-up, collapse),
//! - a fixed-budget node cache with dirty write-back and LRU eviction,
//! - a write-ahead redo log whose checkpoints bound what recovery has
//!   to replay.
//!
//! Keys and values are opaque byte strings. Range scans, transactions
//! and snapshots are out of scope.
//!
//! # Example usage
//!
//! ```
//! use cascadb::{Database, Options};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Database::open(&folder, Options::default())?;
//!
//! // Writes are buffered; durability follows with the log fsync cron
//! db.put("planet", "earth")?;
//!
//! assert_eq!(Some("earth".as_bytes().into()), db.get("planet")?);
//!
//! // Force all dirty nodes out and take a checkpoint
//! db.flush()?;
//! #
//! # Ok::<(), cascadb::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

mod cache;
mod checksum;
mod coding;
mod comparator;
mod compress;
mod db;
mod error;
mod layout;

#[doc(hidden)]
pub mod log;

mod options;
mod slice;
mod status;

#[doc(hidden)]
pub mod store;

mod tree;

/// 64-bit block / node identifier
pub type Bid = u64;

/// 32-bit table number, identifying one tree within a cache
pub type TableNo = u32;

/// 64-bit log sequence number
///
/// LSNs have byte-offset semantics: every appended record advances the
/// LSN by exactly its serialized length.
pub type Lsn = u64;

#[doc(hidden)]
pub use tree::{
    inner::InnerNode,
    leaf::LeafNode,
    msg::{Msg, MsgBuf, MsgOp},
    node::{is_leaf_nid, Node, NodeOps, SchemaNode, NID_LEAF_START, NID_NIL, NID_SCHEMA, NID_START},
};

pub use {
    cache::{Cache, NodeFactory},
    checksum::Checksum,
    coding::{Decode, DecodeError, Encode, EncodeError},
    comparator::{Comparator, LexicalComparator},
    compress::CompressionType,
    db::Database,
    error::{Error, Result},
    layout::{Block, BlockLayout, Layout, WriteCallback},
    log::{LogMgr, LogRecover},
    options::Options,
    slice::Slice,
    status::Status,
    tree::leaf::Record,
    tree::Tree,
};
