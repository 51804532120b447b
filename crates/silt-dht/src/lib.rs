//! Silt DHT - Kademlia-style overlay node.
//!
//! Implements the routing table, the RPC server and client, iterative
//! lookups, TTL'd key/value replication, provider records, the relay
//! client, and the background maintenance loops.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod maintenance;
pub mod node;
pub mod providers;
pub mod relay_client;
pub mod routing;
pub mod server;

use std::time::Duration;

use async_trait::async_trait;
use silt_core::Cid;
use silt_proto::Block;
use thiserror::Error;

pub use node::Node;
pub use routing::RoutingTable;

/// Default bucket size (k).
pub const DEFAULT_K: usize = 20;

/// Default lookup parallelism (alpha).
pub const DEFAULT_ALPHA: usize = 5;

/// Default replication factor for STORE and PUT_BLOCK fan-outs.
pub const DEFAULT_REPLICAS: usize = 5;

/// Default per-call RPC deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Default key/value record lifetime.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Values above this size are silently dropped by STORE receivers (1 MiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1 << 20;

/// Upper bound on a pushed block's serialized size (2 MiB).
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 2 << 20;

/// Interval of the expired-record sweep.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Interval of the origin-record republish loop.
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Interval of the bucket refresh loop.
pub const DEFAULT_BUCKET_REFRESH: Duration = Duration::from_secs(60 * 60);

/// Interval of the contact revalidation loop.
pub const DEFAULT_REVALIDATE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Failure score at which a contact is evicted. Failures add 2, success
/// clears the score.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Tunables for a DHT node.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size (k).
    pub k: usize,
    /// Lookup parallelism (alpha).
    pub alpha: usize,
    /// Replication factor.
    pub replicas: usize,
    /// Per-call RPC deadline.
    pub rpc_timeout: Duration,
    /// Key/value record lifetime.
    pub record_ttl: Duration,
    /// Maximum accepted STORE value size.
    pub max_value_size: usize,
    /// Maximum accepted PUT_BLOCK size.
    pub max_block_size: usize,
    /// Expired-record sweep interval.
    pub gc_interval: Duration,
    /// Origin republish interval.
    pub republish_interval: Duration,
    /// Bucket refresh interval.
    pub bucket_refresh: Duration,
    /// Contact revalidation interval.
    pub revalidate_interval: Duration,
    /// Failure score triggering eviction.
    pub failure_threshold: u32,
    /// Whether PUT_BLOCK RPCs from peers are accepted.
    pub accept_foreign_blocks: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            replicas: DEFAULT_REPLICAS,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            record_ttl: DEFAULT_RECORD_TTL,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            gc_interval: DEFAULT_GC_INTERVAL,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            bucket_refresh: DEFAULT_BUCKET_REFRESH,
            revalidate_interval: DEFAULT_REVALIDATE_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            accept_foreign_blocks: true,
        }
    }
}

/// Errors from DHT operations.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Dial, read or write failure.
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    /// The per-call deadline elapsed.
    #[error("rpc timeout")]
    Timeout,

    /// A frame could not be encoded or decoded.
    #[error("frame: {0}")]
    Frame(#[from] serde_json::Error),

    /// The peer answered with an unexpected frame.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The relay reported a delivery failure.
    #[error("relay: {0}")]
    Relay(String),

    /// A key, value or block was not found after exhausting all paths.
    #[error("not found")]
    NotFound,

    /// A CBOR value could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] silt_proto::ProtoError),
}

/// Local block access the node needs to serve FETCH_BLOCK and accept
/// PUT_BLOCK. Implemented by the blockstore composition layer.
#[async_trait]
pub trait BlockProvider: Send + Sync {
    /// Local-only lookup; never triggers a network fetch.
    async fn get_block_local(&self, cid: &Cid) -> Option<Block>;

    /// Persists a block pushed by a peer, soft-pinned so it survives GC
    /// for the custody window. Returns false when the store rejects it.
    async fn put_foreign_block(&self, block: Block) -> bool;
}
