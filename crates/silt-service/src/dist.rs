//! Distributed store wrapper.
//!
//! Redirects builder writes to the peers whose ids are closest to the
//! block's CID key, keeping selected classes (always manifests, plus a
//! deterministic sample of other blocks) on the local store as a hedge
//! against churn.

use std::sync::Arc;

use async_trait::async_trait;
use silt_core::{hash_key, Cid};
use silt_dag::{BlockSink, BlockSource, DagError};
use silt_dht::Node;
use silt_proto::{Block, BlockType};
use silt_store::Store;
use tracing::debug;

/// Predicate deciding which blocks stay on the local store.
pub type KeepLocalFn = Box<dyn Fn(&Block) -> bool + Send + Sync>;

/// Builds the keep-local selector: manifests always (when enabled), plus
/// a pseudo-random fraction of other blocks chosen by comparing the first
/// 8 digest bytes against a fixed threshold, so the decision is stable
/// across peers and restarts.
pub fn keep_local_selector(manifest_always: bool, fraction: f64) -> KeepLocalFn {
    if fraction <= 0.0 {
        return Box::new(move |b: &Block| {
            manifest_always && b.header.block_type == BlockType::Manifest
        });
    }
    if fraction >= 1.0 {
        return Box::new(|_| true);
    }
    let threshold = (u64::MAX as f64 * fraction) as u64;
    Box::new(move |b: &Block| {
        if manifest_always && b.header.block_type == BlockType::Manifest {
            return true;
        }
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&b.cid.digest[..8]);
        u64::from_be_bytes(prefix) <= threshold
    })
}

/// A [`BlockSink`] that pushes blocks to CID-close peers and falls back
/// to local persistence when nobody accepts them.
pub struct DistStore {
    node: Arc<Node>,
    local: Arc<dyn Store>,
    replicas: usize,
    keep_local: KeepLocalFn,
}

impl DistStore {
    /// Creates the wrapper. `replicas` is clamped to at least 1; a `None`
    /// selector keeps only manifests.
    pub fn new(
        node: Arc<Node>,
        local: Arc<dyn Store>,
        replicas: usize,
        keep_local: Option<KeepLocalFn>,
    ) -> Self {
        Self {
            node,
            local,
            replicas: replicas.max(1),
            keep_local: keep_local.unwrap_or_else(|| keep_local_selector(true, 0.0)),
        }
    }
}

#[async_trait]
impl BlockSource for DistStore {
    async fn get_block(&self, cid: &Cid) -> Result<Block, DagError> {
        Ok(self.local.get_block(cid).await?)
    }
}

#[async_trait]
impl BlockSink for DistStore {
    async fn put_block(&self, block: &Block) -> Result<(), DagError> {
        // Peers are chosen by Kademlia distance to the CID key.
        let target = hash_key(&block.cid.encode());
        let candidates = self
            .node
            .iterative_find_node(target, self.node.config().k)
            .await;

        let mut successes = 0;
        for peer in candidates.iter().filter(|c| c.id != self.node.id) {
            if successes >= self.replicas {
                break;
            }
            match self.node.put_block_to(peer, block).await {
                Ok(()) => successes += 1,
                Err(e) => debug!(cid = %block.cid, peer = %peer.addr, error = %e, "remote put failed"),
            }
        }

        // Keep selected classes locally, and keep everything that found
        // no remote home: availability over placement purity.
        if (self.keep_local)(block) || successes == 0 {
            self.local.put_block(block).await.map_err(DagError::from)?;
            self.local
                .pin_direct(&block.cid)
                .await
                .map_err(DagError::from)?;
        }
        Ok(())
    }
}
