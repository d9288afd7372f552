// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const TAG_NONE: u8 = 0;

#[cfg(feature = "snappy")]
const TAG_SNAPPY: u8 = 1;

/// Compression algorithm to use for node blocks
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression
    #[default]
    None,

    /// Snappy compression
    ///
    /// Recommended for write-heavy workloads where raw node pages
    /// would dominate disk bandwidth.
    #[cfg(feature = "snappy")]
    Snappy,
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::None => writer.write_u8(TAG_NONE)?,

            #[cfg(feature = "snappy")]
            Self::Snappy => writer.write_u8(TAG_SNAPPY)?,
        }

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            TAG_NONE => Ok(Self::None),

            #[cfg(feature = "snappy")]
            TAG_SNAPPY => Ok(Self::Snappy),

            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",

                #[cfg(feature = "snappy")]
                Self::Snappy => "snappy",
            }
        )
    }
}

impl CompressionType {
    /// Compresses a buffer, prepending the method tag.
    ///
    /// Decompression dispatches on the tag, so data written with one
    /// configuration stays readable under another.
    #[must_use]
    pub fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(TAG_NONE);
                out.extend_from_slice(data);
                out
            }

            #[cfg(feature = "snappy")]
            Self::Snappy => {
                let mut out = vec![TAG_SNAPPY];
                out.extend(snap::raw::Encoder::new().compress_vec(data).expect(
                    "snappy compression is infallible for in-memory buffers",
                ));
                out
            }
        }
    }

    /// Decompresses a tagged buffer produced by [`CompressionType::compress`].
    pub fn decompress(data: &[u8]) -> crate::Result<Vec<u8>> {
        let Some((&tag, rest)) = data.split_first() else {
            return Err(crate::Error::Decompress(u8::MAX));
        };

        match tag {
            TAG_NONE => Ok(rest.to_vec()),

            #[cfg(feature = "snappy")]
            TAG_SNAPPY => snap::raw::Decoder::new()
                .decompress_vec(rest)
                .map_err(|_| crate::Error::Decompress(tag)),

            tag => Err(crate::Error::Decompress(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_serialize_none() {
        let serialized = CompressionType::None.encode_into_vec();
        assert_eq!(1, serialized.len());
    }

    #[test]
    fn compression_none_roundtrip() -> crate::Result<()> {
        let data = b"the quick brown fox".repeat(10);
        let compressed = CompressionType::None.compress(&data);
        assert_eq!(1 + data.len(), compressed.len());
        assert_eq!(data, CompressionType::decompress(&compressed)?);
        Ok(())
    }

    #[test]
    fn compression_unknown_tag() {
        assert!(CompressionType::decompress(&[250, 1, 2, 3]).is_err());
        assert!(CompressionType::decompress(&[]).is_err());
    }

    #[cfg(feature = "snappy")]
    mod snappy {
        use super::*;
        use test_log::test;

        #[test]
        fn compression_snappy_roundtrip() -> crate::Result<()> {
            let data = b"aaaaaaaaaabbbbbbbbbbccccccc".repeat(100);
            let compressed = CompressionType::Snappy.compress(&data);
            assert!(compressed.len() < data.len());
            assert_eq!(data, CompressionType::decompress(&compressed)?);
            Ok(())
        }

        #[test]
        fn compression_snappy_readable_without_config() -> crate::Result<()> {
            // decompress dispatches on the stream tag, not the configured method
            let data = b"tagged stream".to_vec();
            let compressed = CompressionType::Snappy.compress(&data);
            assert_eq!(data, CompressionType::decompress(&compressed)?);
            Ok(())
        }
    }
}
