//! Block framing.
//!
//! A block is the canonical CBOR encoding of its header concatenated with
//! the raw payload. The CID is BLAKE3-256 over the whole sequence, so any
//! mutation of header or payload is detected on decode.

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use silt_core::Cid;
use thiserror::Error;

/// Codec tag for raw leaf payloads.
pub const CODEC_RAW: &str = "raw";

/// Codec tag for CBOR-encoded payloads (internal nodes, manifests).
pub const CODEC_CBOR: &str = "cbor";

/// Errors from block encoding and decoding.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Header could not be encoded.
    #[error("encode header: {0}")]
    EncodeHeader(String),

    /// Header could not be decoded.
    #[error("decode header: {0}")]
    DecodeHeader(String),

    /// Fewer payload bytes remained than the header size declares.
    #[error("truncated payload")]
    TruncatedPayload,

    /// A CBOR payload could not be decoded.
    #[error("decode payload: {0}")]
    DecodePayload(String),

    /// A CBOR payload could not be encoded.
    #[error("encode payload: {0}")]
    EncodePayload(String),

    /// An embedded CID had the wrong length.
    #[error(transparent)]
    Cid(#[from] silt_core::CidError),

    /// The block type tag was unknown.
    #[error("unknown block type: {0}")]
    UnknownType(u8),
}

/// Kind of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    /// Raw file chunk.
    Data = 1,
    /// Internal DAG node.
    Node = 2,
    /// Top-level file manifest.
    Manifest = 3,
}

impl BlockType {
    /// Returns the tag value for encoding.
    pub const fn tag(&self) -> u8 {
        *self as u8
    }

    /// Creates from a tag value.
    pub fn from_tag(tag: u8) -> Result<Self, ProtoError> {
        match tag {
            1 => Ok(BlockType::Data),
            2 => Ok(BlockType::Node),
            3 => Ok(BlockType::Manifest),
            other => Err(ProtoError::UnknownType(other)),
        }
    }
}

/// Block header, encoded as the canonical CBOR array `[v, type, size, codec]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Header version, currently 1.
    pub v: u8,
    /// Block kind.
    pub block_type: BlockType,
    /// Payload length in bytes. Must equal the actual payload length.
    pub size: u64,
    /// Payload codec, `"raw"` or `"cbor"`.
    pub codec: String,
}

impl Serialize for BlockHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(4))?;
        seq.serialize_element(&self.v)?;
        seq.serialize_element(&self.block_type.tag())?;
        seq.serialize_element(&self.size)?;
        seq.serialize_element(&self.codec)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for BlockHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderVisitor;

        impl<'de> Visitor<'de> for HeaderVisitor {
            type Value = BlockHeader;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 4-element block header array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<BlockHeader, A::Error> {
                let v: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let tag: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let size: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let codec: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                let block_type = BlockType::from_tag(tag)
                    .map_err(|e| de::Error::custom(e.to_string()))?;
                Ok(BlockHeader {
                    v,
                    block_type,
                    size,
                    codec,
                })
            }
        }

        deserializer.deserialize_seq(HeaderVisitor)
    }
}

/// A block: canonical header bytes followed by the raw payload, addressed
/// by the CID of the whole sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Content identifier, `Cid::of(bytes)`.
    pub cid: Cid,
    /// Decoded header.
    pub header: BlockHeader,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Full serialized form, `canonical(header) ‖ payload`.
    pub bytes: Vec<u8>,
}

impl Block {
    /// Builds a block from its parts, serializing the header canonically
    /// and computing the CID.
    pub fn build(block_type: BlockType, codec: &str, payload: Vec<u8>) -> Result<Self, ProtoError> {
        let header = BlockHeader {
            v: 1,
            block_type,
            size: payload.len() as u64,
            codec: codec.to_string(),
        };
        let mut bytes = serde_cbor::to_vec(&header)
            .map_err(|e| ProtoError::EncodeHeader(e.to_string()))?;
        bytes.extend_from_slice(&payload);
        let cid = Cid::of(&bytes);
        Ok(Self {
            cid,
            header,
            payload,
            bytes,
        })
    }

    /// Decodes a block from raw bytes: the first CBOR value is the header,
    /// the following `header.size` bytes are the payload. The CID is
    /// recomputed from the decoded bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
        let mut de = serde_cbor::Deserializer::from_slice(raw);
        let header = BlockHeader::deserialize(&mut de)
            .map_err(|e| ProtoError::DecodeHeader(e.to_string()))?;
        let header_len = de.byte_offset();

        let remaining = raw.len() - header_len;
        if (remaining as u64) < header.size {
            return Err(ProtoError::TruncatedPayload);
        }
        let end = header_len + header.size as usize;
        let payload = raw[header_len..end].to_vec();
        let bytes = raw[..end].to_vec();
        let cid = Cid::of(&bytes);
        Ok(Self {
            cid,
            header,
            payload,
            bytes,
        })
    }
}
