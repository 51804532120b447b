//! Silt DAG - Merkle DAG construction, verification and retrieval.
//!
//! Files are chunked into Data leaves, grouped under fan-out Node blocks,
//! and topped by a Manifest block whose CID names the file. Every retrieval
//! path re-verifies block bytes against their CID before trusting them.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod builder;
pub mod fetch;
pub mod verify;

use async_trait::async_trait;
use silt_core::Cid;
use silt_proto::{Block, ProtoError};
use thiserror::Error;

pub use builder::DagBuilder;
pub use fetch::{fetch, fetch_parallel};
pub use verify::verify;

/// Default chunk size for leaves (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Default fan-out for internal nodes.
pub const DEFAULT_FANOUT: usize = 256;

/// Subtrees at or below this span are fetched inline instead of spawning
/// a task (64 KiB).
pub const INLINE_SPAN: u64 = 1 << 16;

/// Default parallelism for [`fetch_parallel`] when callers pass 0.
pub const DEFAULT_PARALLEL: usize = 16;

/// Errors from DAG operations.
#[derive(Debug, Error)]
pub enum DagError {
    /// A referenced block could not be retrieved anywhere.
    #[error("block not found")]
    NotFound,

    /// Recomputed CID, span or shape did not match what the parent declared.
    #[error("integrity: {0}")]
    Integrity(String),

    /// The addressed block is not a manifest.
    #[error("not a manifest")]
    NotManifest,

    /// Builder was configured with a zero chunk size or fan-out below 2.
    #[error("invalid builder params")]
    InvalidParams,

    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] ProtoError),

    /// The backing store failed.
    #[error("store: {0}")]
    Store(String),

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,
}

/// Read access to blocks, local or via a network fetch path.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Retrieves a block by CID.
    async fn get_block(&self, cid: &Cid) -> Result<Block, DagError>;
}

/// Write access used by the builder; every store is also a source.
#[async_trait]
pub trait BlockSink: BlockSource {
    /// Persists a block.
    async fn put_block(&self, block: &Block) -> Result<(), DagError>;
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Minimal in-memory sink for exercising the builder and fetchers.
    #[derive(Default)]
    pub struct MapStore {
        blocks: Mutex<HashMap<Cid, Vec<u8>>>,
    }

    impl MapStore {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn len(&self) -> usize {
            self.blocks.lock().len()
        }

        /// Flips one payload bit of the stored block, keeping the index key.
        pub fn corrupt(&self, cid: &Cid) {
            let mut blocks = self.blocks.lock();
            if let Some(bytes) = blocks.get_mut(cid) {
                let last = bytes.len() - 1;
                bytes[last] ^= 0x01;
            }
        }
    }

    #[async_trait]
    impl BlockSource for MapStore {
        async fn get_block(&self, cid: &Cid) -> Result<Block, DagError> {
            let raw = self
                .blocks
                .lock()
                .get(cid)
                .cloned()
                .ok_or(DagError::NotFound)?;
            Ok(Block::decode(&raw)?)
        }
    }

    #[async_trait]
    impl BlockSink for MapStore {
        async fn put_block(&self, block: &Block) -> Result<(), DagError> {
            self.blocks
                .lock()
                .insert(block.cid, block.bytes.clone());
            Ok(())
        }
    }
}
