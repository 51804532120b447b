//! Provider records.
//!
//! A provider record binds a CID to a peer that holds the block. Records
//! are stored on the DHT under the textual CID as key and encoded as a
//! canonical CBOR map with length-first sorted keys, so independent peers
//! produce identical bytes for identical records.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::{ByteBuf, Bytes};
use silt_core::{Cid, NodeId};

use crate::block::ProtoError;

/// A record advertising that a peer can serve a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    /// Record version, currently 0.
    pub v: u8,
    /// CID of the advertised block.
    pub cid: Cid,
    /// Id of the providing peer.
    pub peer: NodeId,
    /// Dialable address of the peer.
    pub addr: String,
    /// Relay address, empty when the peer is directly reachable.
    pub relay: String,
}

impl ProviderRecord {
    /// Encodes the record as canonical CBOR.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtoError> {
        serde_cbor::to_vec(self).map_err(|e| ProtoError::EncodePayload(e.to_string()))
    }

    /// Decodes a record from canonical CBOR.
    pub fn from_slice(raw: &[u8]) -> Result<Self, ProtoError> {
        serde_cbor::from_slice(raw).map_err(|e| ProtoError::DecodePayload(e.to_string()))
    }
}

// Canonical key order is length-first then bytewise:
// "v" < "cid" < "peer" < "addrs" < "relay". The relay entry is omitted
// for directly reachable peers.
impl Serialize for ProviderRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = if self.relay.is_empty() { 4 } else { 5 };
        let mut map = serializer.serialize_map(Some(entries))?;
        map.serialize_entry("v", &self.v)?;
        map.serialize_entry("cid", Bytes::new(&self.cid.to_bytes()))?;
        map.serialize_entry("peer", Bytes::new(self.peer.as_bytes()))?;
        map.serialize_entry("addrs", Bytes::new(self.addr.as_bytes()))?;
        if !self.relay.is_empty() {
            map.serialize_entry("relay", Bytes::new(self.relay.as_bytes()))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ProviderRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = ProviderRecord;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a provider record map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ProviderRecord, A::Error> {
                let mut v: Option<u8> = None;
                let mut cid: Option<Cid> = None;
                let mut peer: Option<NodeId> = None;
                let mut addr: Option<String> = None;
                let mut relay = String::new();

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "v" => v = Some(map.next_value()?),
                        "cid" => {
                            let buf: ByteBuf = map.next_value()?;
                            cid = Some(
                                Cid::from_bytes(&buf)
                                    .map_err(|e| de::Error::custom(format!("bad cid: {e}")))?,
                            );
                        }
                        "peer" => {
                            let buf: ByteBuf = map.next_value()?;
                            if buf.len() != 32 {
                                return Err(de::Error::custom("bad peer id length"));
                            }
                            let mut bytes = [0u8; 32];
                            bytes.copy_from_slice(&buf);
                            peer = Some(NodeId::new(bytes));
                        }
                        "addrs" => {
                            let buf: ByteBuf = map.next_value()?;
                            addr = Some(
                                String::from_utf8(buf.into_vec())
                                    .map_err(|_| de::Error::custom("addr not utf-8"))?,
                            );
                        }
                        "relay" => {
                            let buf: ByteBuf = map.next_value()?;
                            relay = String::from_utf8(buf.into_vec())
                                .map_err(|_| de::Error::custom("relay not utf-8"))?;
                        }
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }

                Ok(ProviderRecord {
                    v: v.ok_or_else(|| de::Error::missing_field("v"))?,
                    cid: cid.ok_or_else(|| de::Error::missing_field("cid"))?,
                    peer: peer.ok_or_else(|| de::Error::missing_field("peer"))?,
                    addr: addr.ok_or_else(|| de::Error::missing_field("addrs"))?,
                    relay,
                })
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(relay: &str) -> ProviderRecord {
        ProviderRecord {
            v: 0,
            cid: Cid::of(b"block"),
            peer: NodeId::new([0x42; 32]),
            addr: "10.0.0.7:30050".to_string(),
            relay: relay.to_string(),
        }
    }

    #[test]
    fn test_roundtrip_direct() {
        let rec = sample_record("");
        let raw = rec.to_vec().unwrap();
        assert_eq!(ProviderRecord::from_slice(&raw).unwrap(), rec);
    }

    #[test]
    fn test_roundtrip_relayed() {
        let rec = sample_record("relay.example:20018");
        let raw = rec.to_vec().unwrap();
        assert_eq!(ProviderRecord::from_slice(&raw).unwrap(), rec);
    }

    #[test]
    fn test_deterministic_encoding() {
        let a = sample_record("").to_vec().unwrap();
        let b = sample_record("").to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_relay_omitted_when_empty() {
        let direct = sample_record("").to_vec().unwrap();
        let relayed = sample_record("r:1").to_vec().unwrap();
        assert!(direct.len() < relayed.len());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ProviderRecord::from_slice(b"not cbor at all").is_err());
    }
}
