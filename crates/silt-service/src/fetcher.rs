//! Network fetch path: resolves provider records via the DHT and dials
//! each provider (direct or through its relay) until one serves the block.

use std::sync::Arc;

use async_trait::async_trait;
use silt_core::Cid;
use silt_dht::Node;
use silt_proto::Contact;
use silt_store::{BlockFetcher, StoreError};
use tracing::debug;

/// [`BlockFetcher`] implementation on top of the DHT node.
pub struct ProviderFetcher {
    node: Arc<Node>,
}

impl ProviderFetcher {
    /// Creates a fetcher using the given node for lookups and dials.
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl BlockFetcher for ProviderFetcher {
    async fn fetch_block(&self, cid: &Cid) -> Result<Vec<u8>, StoreError> {
        let records = self
            .node
            .get_provider_records(cid)
            .await
            .map_err(|_| StoreError::NotFound)?;

        let mut last_err = StoreError::NotFound;
        for record in records {
            let contact = Contact {
                id: record.peer,
                addr: record.addr.clone(),
                relay: record.relay.clone(),
            };
            match self.node.fetch_block_from(&contact, cid).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(cid = %cid, provider = %contact.addr, error = %e, "provider failed");
                    last_err = StoreError::Fetch(e.to_string());
                }
            }
        }
        Err(last_err)
    }

    async fn announce(&self, cid: &Cid) -> Result<(), StoreError> {
        self.node
            .put_provider_record(cid)
            .await
            .map_err(|e| StoreError::Fetch(e.to_string()))
    }

    async fn unannounce(&self, cid: &Cid) -> Result<(), StoreError> {
        self.node.delete_provider_record(cid);
        Ok(())
    }
}
