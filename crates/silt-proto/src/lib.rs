//! Silt Proto - Wire protocol and message definitions.
//!
//! This crate defines:
//! - Block framing and the canonical CBOR profile (header ‖ payload)
//! - Merkle DAG payloads (internal nodes and manifests)
//! - Provider records published to the DHT
//! - RPC frames exchanged over TCP and relay frames
//!
//! Every CBOR encoding in this crate is reproducible byte-for-byte: structs
//! encode as definite-length arrays in fixed field order (or canonically
//! sorted maps for provider records), and the encoder emits shortest-form
//! integers.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod block;
pub mod dag;
pub mod provider;
pub mod relay;
pub mod rpc;

pub use block::{Block, BlockHeader, BlockType, ProtoError, CODEC_CBOR, CODEC_RAW};
pub use dag::{child_cids, ManifestPayload, NodePayload};
pub use provider::ProviderRecord;
pub use relay::{Frame, FrameKind};
pub use rpc::{Contact, RpcKind, RpcMessage};
