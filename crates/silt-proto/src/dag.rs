//! Merkle DAG payloads.
//!
//! Internal nodes carry an ordered list of child CIDs and their byte spans;
//! the manifest names the file and points at the DAG root. Both encode as
//! canonical CBOR arrays so the blocks that carry them have stable CIDs.

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use silt_core::Cid;

use crate::block::{Block, BlockType, ProtoError};

/// Serializes a CID as a CBOR byte string of its 34-byte tuple.
struct CidBytes<'a>(&'a Cid);

impl Serialize for CidBytes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0.to_bytes())
    }
}

/// Serializes a CID list as a CBOR array of byte strings.
struct CidSeq<'a>(&'a [Cid]);

impl Serialize for CidSeq<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for cid in self.0 {
            seq.serialize_element(&CidBytes(cid))?;
        }
        seq.end()
    }
}

fn cid_from_buf<E: de::Error>(buf: &ByteBuf) -> Result<Cid, E> {
    Cid::from_bytes(buf).map_err(|e| E::custom(format!("bad child cid: {e}")))
}

/// Payload of an internal DAG node, the canonical CBOR array
/// `[v, size, fanout, cids, spans]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePayload {
    /// Payload version, currently 1.
    pub v: u8,
    /// Total bytes spanned by this subtree, the sum of `spans`.
    pub size: u64,
    /// Fan-out the builder used for this level.
    pub fanout: u16,
    /// Child CIDs, left to right.
    pub cids: Vec<Cid>,
    /// Byte span of each child, index-aligned with `cids`.
    pub spans: Vec<u64>,
}

impl NodePayload {
    /// Encodes the payload as canonical CBOR.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtoError> {
        serde_cbor::to_vec(self).map_err(|e| ProtoError::EncodePayload(e.to_string()))
    }

    /// Decodes a payload from canonical CBOR.
    pub fn from_slice(raw: &[u8]) -> Result<Self, ProtoError> {
        serde_cbor::from_slice(raw).map_err(|e| ProtoError::DecodePayload(e.to_string()))
    }
}

impl Serialize for NodePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(5))?;
        seq.serialize_element(&self.v)?;
        seq.serialize_element(&self.size)?;
        seq.serialize_element(&self.fanout)?;
        seq.serialize_element(&CidSeq(&self.cids))?;
        seq.serialize_element(&self.spans)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for NodePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeVisitor;

        impl<'de> Visitor<'de> for NodeVisitor {
            type Value = NodePayload;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 5-element node payload array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<NodePayload, A::Error> {
                let v: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let size: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let fanout: u16 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let raw_cids: Vec<ByteBuf> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                let spans: Vec<u64> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(4, &self))?;
                let cids = raw_cids
                    .iter()
                    .map(cid_from_buf)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(NodePayload {
                    v,
                    size,
                    fanout,
                    cids,
                    spans,
                })
            }
        }

        deserializer.deserialize_seq(NodeVisitor)
    }
}

/// Payload of a manifest block, the canonical CBOR array
/// `[v, size, chunk, fanout, root, name, mime]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPayload {
    /// Payload version, currently 1.
    pub v: u8,
    /// Total file size in bytes.
    pub size: u64,
    /// Chunk size the builder used.
    pub chunk: u32,
    /// Fan-out the builder used.
    pub fanout: u16,
    /// CID of the DAG root: a single Data block or the apex Node block.
    pub root: Cid,
    /// Logical file name.
    pub name: String,
    /// MIME type of the content.
    pub mime: String,
}

impl ManifestPayload {
    /// Encodes the payload as canonical CBOR.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtoError> {
        serde_cbor::to_vec(self).map_err(|e| ProtoError::EncodePayload(e.to_string()))
    }

    /// Decodes a payload from canonical CBOR.
    pub fn from_slice(raw: &[u8]) -> Result<Self, ProtoError> {
        serde_cbor::from_slice(raw).map_err(|e| ProtoError::DecodePayload(e.to_string()))
    }
}

impl Serialize for ManifestPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(7))?;
        seq.serialize_element(&self.v)?;
        seq.serialize_element(&self.size)?;
        seq.serialize_element(&self.chunk)?;
        seq.serialize_element(&self.fanout)?;
        seq.serialize_element(&CidBytes(&self.root))?;
        seq.serialize_element(&self.name)?;
        seq.serialize_element(&self.mime)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for ManifestPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ManifestVisitor;

        impl<'de> Visitor<'de> for ManifestVisitor {
            type Value = ManifestPayload;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 7-element manifest payload array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ManifestPayload, A::Error> {
                let v: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let size: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let chunk: u32 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let fanout: u16 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                let root_buf: ByteBuf = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(4, &self))?;
                let name: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(5, &self))?;
                let mime: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(6, &self))?;
                let root = cid_from_buf(&root_buf)?;
                Ok(ManifestPayload {
                    v,
                    size,
                    chunk,
                    fanout,
                    root,
                    name,
                    mime,
                })
            }
        }

        deserializer.deserialize_seq(ManifestVisitor)
    }
}

/// Extracts the child CIDs referenced by a block.
///
/// Data blocks have none; Node blocks list their children; Manifest blocks
/// reference exactly the DAG root.
pub fn child_cids(block: &Block) -> Result<Vec<Cid>, ProtoError> {
    match block.header.block_type {
        BlockType::Data => Ok(Vec::new()),
        BlockType::Node => {
            let payload = NodePayload::from_slice(&block.payload)?;
            Ok(payload.cids)
        }
        BlockType::Manifest => {
            let payload = ManifestPayload::from_slice(&block.payload)?;
            Ok(vec![payload.root])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CODEC_CBOR;

    fn sample_cid(seed: u8) -> Cid {
        Cid::of(&[seed])
    }

    #[test]
    fn test_node_payload_roundtrip() {
        let payload = NodePayload {
            v: 1,
            size: 12,
            fanout: 4,
            cids: vec![sample_cid(1), sample_cid(2), sample_cid(3)],
            spans: vec![4, 4, 4],
        };
        let raw = payload.to_vec().unwrap();
        let back = NodePayload::from_slice(&raw).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_node_payload_deterministic() {
        let payload = NodePayload {
            v: 1,
            size: 7,
            fanout: 2,
            cids: vec![sample_cid(9)],
            spans: vec![7],
        };
        assert_eq!(payload.to_vec().unwrap(), payload.to_vec().unwrap());
    }

    #[test]
    fn test_manifest_payload_roundtrip() {
        let payload = ManifestPayload {
            v: 1,
            size: 1024,
            chunk: 256,
            fanout: 16,
            root: sample_cid(7),
            name: "notes.txt".to_string(),
            mime: "text/plain".to_string(),
        };
        let raw = payload.to_vec().unwrap();
        let back = ManifestPayload::from_slice(&raw).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_child_cids_per_type() {
        let leaf = Block::build(BlockType::Data, "raw", b"chunk".to_vec()).unwrap();
        assert!(child_cids(&leaf).unwrap().is_empty());

        let node_payload = NodePayload {
            v: 1,
            size: 5,
            fanout: 2,
            cids: vec![leaf.cid],
            spans: vec![5],
        };
        let node =
            Block::build(BlockType::Node, CODEC_CBOR, node_payload.to_vec().unwrap()).unwrap();
        assert_eq!(child_cids(&node).unwrap(), vec![leaf.cid]);

        let manifest_payload = ManifestPayload {
            v: 1,
            size: 5,
            chunk: 5,
            fanout: 2,
            root: node.cid,
            name: "f".to_string(),
            mime: String::new(),
        };
        let manifest = Block::build(
            BlockType::Manifest,
            CODEC_CBOR,
            manifest_payload.to_vec().unwrap(),
        )
        .unwrap();
        assert_eq!(child_cids(&manifest).unwrap(), vec![node.cid]);
    }
}
