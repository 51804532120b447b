//! Relay frames.
//!
//! The relay terminates two streams and routes RPC frames between them
//! using a correlation id. Attached peers hold one long-lived stream;
//! clients open a short-lived stream per request.

use serde::{Deserialize, Serialize};

use crate::rpc::RpcMessage;

/// Relay frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    /// Associate the stream with a node id for inbound delivery.
    Register,
    /// Ask the relay for the client's observed remote host.
    Whoami,
    /// Relay → attached peer: a forwarded client request.
    DeliverRequest,
    /// Attached peer → relay: the response to a delivered request.
    DeliverResponse,
    /// Client → relay: request destined for an attached peer.
    ClientRequest,
    /// Relay → client: the correlated response.
    ClientResponse,
}

/// JSON envelope exchanged between clients, the relay, and attached peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Frame kind.
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Correlation id for request/response matching.
    #[serde(rename = "reqId", default, skip_serializing_if = "String::is_empty")]
    pub req_id: String,
    /// Hex id of the addressed peer.
    #[serde(rename = "targetId", default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,
    /// Embedded RPC payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<RpcMessage>,
    /// Error description on failed forwards.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Frame {
    /// Creates a frame with the given kind and no operands.
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            req_id: String::new(),
            target_id: String::new(),
            payload: None,
            error: String::new(),
        }
    }

    /// Sets the correlation id.
    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = req_id.into();
        self
    }

    /// Sets the target peer id.
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = target_id.into();
        self
    }

    /// Sets the embedded RPC payload.
    pub fn with_payload(mut self, payload: RpcMessage) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the error description.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }
}
