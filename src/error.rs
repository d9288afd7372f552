// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    checksum::Checksum,
    coding::{DecodeError, EncodeError},
};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed (method tag)
    Decompress(u8),

    /// Invalid checksum value (got, expected)
    ChecksumMismatch {
        /// The checksum that was computed
        got: Checksum,

        /// The checksum that was stored
        expected: Checksum,
    },

    /// A redo log file is corrupt; recovery cannot proceed past it
    LogCorrupt(&'static str),

    /// Required configuration is missing (e.g. no directory or comparator)
    InvalidConfiguration(&'static str),

    /// A table number is already registered, or a required table is missing
    TableConflict(u32),

    /// Data file carries an unknown magic number or version
    InvalidSuperBlock,

    /// A requested node does not exist in the layout
    BlockNotFound(u64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CascadbError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
