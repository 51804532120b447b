//! Provider record publish and resolution.

use std::sync::Arc;

use silt_core::Cid;
use silt_proto::ProviderRecord;
use tracing::debug;

use crate::node::Node;
use crate::DhtError;

impl Node {
    /// Publishes a provider record for a CID under its textual form,
    /// advertising this node's dialable address and relay.
    pub async fn put_provider_record(self: &Arc<Self>, cid: &Cid) -> Result<(), DhtError> {
        let record = ProviderRecord {
            v: 0,
            cid: *cid,
            peer: self.id,
            addr: self.dialable_addr(),
            relay: self.relay_addr(),
        };
        let bytes = record.to_vec()?;
        self.store(&cid.encode(), bytes).await?;
        Ok(())
    }

    /// Resolves every reachable provider record for a CID. Records that
    /// fail to decode are skipped.
    pub async fn get_provider_records(
        self: &Arc<Self>,
        cid: &Cid,
    ) -> Result<Vec<ProviderRecord>, DhtError> {
        let values = self.get_closest(&cid.encode()).await?;
        let mut records = Vec::with_capacity(values.len());
        for value in values {
            match ProviderRecord::from_slice(&value) {
                Ok(record) => records.push(record),
                Err(e) => debug!(cid = %cid, error = %e, "skipping undecodable provider record"),
            }
        }
        if records.is_empty() {
            return Err(DhtError::NotFound);
        }
        Ok(records)
    }

    /// Removes the local provider record for a CID. Remote replicas
    /// expire via their record TTL.
    pub fn delete_provider_record(&self, cid: &Cid) {
        self.kv_remove(&cid.encode());
    }
}
