//! Adapter exposing the blockstore to the DHT node's RPC handlers.

use std::sync::Arc;

use async_trait::async_trait;
use silt_core::Cid;
use silt_dht::BlockProvider;
use silt_proto::Block;
use silt_store::Store;
use tracing::debug;

/// Serves FETCH_BLOCK from the local store and accepts PUT_BLOCK pushes,
/// soft-pinning them so replicated custody survives GC for the TTL window.
pub struct NodeBlockProvider {
    store: Arc<dyn Store>,
}

impl NodeBlockProvider {
    /// Creates the adapter.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockProvider for NodeBlockProvider {
    async fn get_block_local(&self, cid: &Cid) -> Option<Block> {
        self.store.get_block_local(cid).await.ok()
    }

    async fn put_foreign_block(&self, block: Block) -> bool {
        let cid = block.cid;
        if let Err(e) = self.store.put_block_locally(&block).await {
            debug!(cid = %cid, error = %e, "rejecting pushed block");
            return false;
        }
        self.store.pin_soft(&cid).await.is_ok()
    }
}
