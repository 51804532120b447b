//! RPC frames.
//!
//! One request and one response per TCP connection, each a single line of
//! JSON. The same frame shape serves every message kind; unused fields are
//! omitted from the wire.

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use silt_core::NodeId;

/// Message kinds understood by the request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcKind {
    /// Liveness probe; the response carries the responder's contact.
    Ping,
    /// Store a key/value record on the receiver.
    Store,
    /// Return the k closest contacts to a target id.
    FindNode,
    /// Return a value if present, else closer contacts.
    FindValue,
    /// Return a locally held block's bytes.
    FetchBlock,
    /// Push a block to the receiver for replication.
    PutBlock,
}

/// A peer address as seen by the routing layer.
///
/// Two contacts are equal iff their `(id, addr)` pair is equal. A contact
/// with a non-empty `relay` is reached by sending to the relay, addressed
/// by target id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    /// Peer id.
    pub id: NodeId,
    /// Dialable `host:port`.
    #[serde(default)]
    pub addr: String,
    /// Relay `host:port`, empty for directly reachable peers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relay: String,
}

impl Contact {
    /// Key used for dedup and failure accounting.
    pub fn endpoint_key(&self) -> String {
        format!("{}@{}", self.id.to_hex(), self.addr)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for Contact {}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A single RPC request or response frame.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: RpcKind,
    /// Sender contact; receivers feed it into their routing table.
    pub from: Contact,
    /// Key operand: hex target for FIND_NODE, textual CID for block
    /// operations, arbitrary text for key/value operations.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Value operand, base64 on the wire.
    #[serde_as(as = "Base64")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<u8>,
    /// Contacts returned by FIND_NODE / FIND_VALUE misses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Contact>,
    /// Whether a FIND_VALUE / FETCH_BLOCK hit.
    #[serde(default, skip_serializing_if = "is_false")]
    pub found: bool,
}

impl RpcMessage {
    /// Creates a frame with empty operands.
    pub fn new(kind: RpcKind, from: Contact) -> Self {
        Self {
            kind,
            from,
            key: String::new(),
            value: Vec::new(),
            nodes: Vec::new(),
            found: false,
        }
    }

    /// Sets the key operand.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the value operand.
    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    /// Sets the returned contacts.
    pub fn with_nodes(mut self, nodes: Vec<Contact>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Marks the frame as a hit.
    pub fn found(mut self) -> Self {
        self.found = true;
        self
    }
}
