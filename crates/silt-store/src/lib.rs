//! Silt Store - Local block persistence.
//!
//! Two variants share one contract: an in-memory store for tests and
//! ephemeral nodes, and an on-disk store backed by a RocksDB index with
//! block payloads in content-addressed files. Both support hard pins
//! (recursive or direct), TTL'd soft pins acting as a read cache, and
//! mark-and-sweep GC over the pinned DAGs.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod disk;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use silt_core::Cid;
use silt_dag::{BlockSink, BlockSource, DagError};
use silt_proto::{Block, ProtoError};
use thiserror::Error;

pub use disk::DiskStore;
pub use memory::MemStore;

/// Default lifetime of a soft pin (6 hours), refreshed on every local read.
pub const DEFAULT_SOFT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Errors from blockstore operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Block absent locally and not retrievable via the fetcher.
    #[error("block not found")]
    NotFound,

    /// Stored or fetched bytes failed CID verification.
    #[error("integrity: {0}")]
    Integrity(String),

    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Index failure.
    #[error("database: {0}")]
    Database(String),

    /// Block or payload encoding failure.
    #[error(transparent)]
    Codec(#[from] ProtoError),

    /// The network fetch path failed.
    #[error("fetch: {0}")]
    Fetch(String),
}

impl From<StoreError> for DagError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => DagError::NotFound,
            StoreError::Integrity(msg) => DagError::Integrity(msg),
            StoreError::Codec(inner) => DagError::Codec(inner),
            other => DagError::Store(other.to_string()),
        }
    }
}

/// Hard pin mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Protects the whole DAG reachable from the pinned CID.
    Recursive,
    /// Protects only the pinned block itself.
    Direct,
}

/// The blockstore contract shared by both variants.
#[async_trait]
pub trait Store: Send + Sync {
    /// Write-through put: persist, then announce a provider record when a
    /// fetcher is configured.
    async fn put_block(&self, block: &Block) -> Result<(), StoreError>;

    /// Persist without announcing.
    async fn put_block_locally(&self, block: &Block) -> Result<(), StoreError>;

    /// Local lookup, falling back to the network fetch path on a miss.
    /// Remotely fetched blocks are cached locally under a soft pin;
    /// manifests are announced on cache fill.
    async fn get_block(&self, cid: &Cid) -> Result<Block, StoreError>;

    /// Local-only lookup used by RPC serving; never refetches. Refreshes
    /// an existing soft pin on every hit.
    async fn get_block_local(&self, cid: &Cid) -> Result<Block, StoreError>;

    /// Marks a hard recursive pin, clearing any soft pin. Pinning a CID
    /// with no local block fails with [`StoreError::NotFound`].
    async fn pin(&self, cid: &Cid) -> Result<(), StoreError>;

    /// Marks a hard direct pin, clearing any soft pin. Pinning a CID
    /// with no local block fails with [`StoreError::NotFound`].
    async fn pin_direct(&self, cid: &Cid) -> Result<(), StoreError>;

    /// Sets a soft pin expiring after the soft TTL, unless a hard pin
    /// already protects the CID.
    async fn pin_soft(&self, cid: &Cid) -> Result<(), StoreError>;

    /// Removes hard and soft pins for the CID; children are untouched.
    async fn unpin(&self, cid: &Cid) -> Result<(), StoreError>;

    /// Lists hard pins only.
    async fn list_pins(&self) -> Result<Vec<Cid>, StoreError>;

    /// Mark-and-sweep GC. Returns the number of blocks freed.
    async fn gc(&self) -> Result<usize, StoreError>;

    /// Returns `(blocks, bytes)` currently stored.
    async fn stats(&self) -> Result<(usize, u64), StoreError>;
}

/// Network side of the blockstore: pulls missing blocks from providers
/// and maintains provider records. Implemented by the composition layer
/// on top of the DHT node.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Fetches a block's raw bytes from any provider.
    async fn fetch_block(&self, cid: &Cid) -> Result<Vec<u8>, StoreError>;

    /// Publishes a provider record for a CID held locally.
    async fn announce(&self, cid: &Cid) -> Result<(), StoreError>;

    /// Withdraws the local provider record; remote replicas expire by TTL.
    async fn unannounce(&self, cid: &Cid) -> Result<(), StoreError>;
}

/// Adapter exposing any [`Store`] as the DAG layer's block source/sink.
#[derive(Clone)]
pub struct DagStore(pub Arc<dyn Store>);

#[async_trait]
impl BlockSource for DagStore {
    async fn get_block(&self, cid: &Cid) -> Result<Block, DagError> {
        Ok(self.0.get_block(cid).await?)
    }
}

#[async_trait]
impl BlockSink for DagStore {
    async fn put_block(&self, block: &Block) -> Result<(), DagError> {
        Ok(self.0.put_block(block).await?)
    }
}
