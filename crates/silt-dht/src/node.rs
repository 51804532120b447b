//! The DHT node: identity, routing table, key/value store and failure
//! accounting. The RPC client, server, relay client, provider records and
//! maintenance loops live in sibling modules and all hang off [`Node`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use silt_core::NodeId;
use silt_proto::Contact;
use tracing::debug;

use crate::{BlockProvider, DhtConfig};

/// A stored key/value record.
#[derive(Debug, Clone)]
pub(crate) struct KvRecord {
    pub value: Vec<u8>,
    pub expires: Instant,
    /// True exactly on the node that first stored the key; governs republish.
    pub origin: bool,
}

/// A Kademlia overlay node.
pub struct Node {
    /// Node identity, persisted across restarts by the caller.
    pub id: NodeId,
    pub(crate) listen_addr: RwLock<String>,
    pub(crate) advertised_addr: RwLock<String>,
    pub(crate) relay_addr: RwLock<String>,
    pub(crate) rt: crate::RoutingTable,
    pub(crate) kv: RwLock<HashMap<String, KvRecord>>,
    pub(crate) fail_counts: Mutex<HashMap<String, u32>>,
    pub(crate) block_provider: RwLock<Option<Arc<dyn BlockProvider>>>,
    pub(crate) config: DhtConfig,
}

impl Node {
    /// Creates a node with a given identity listening at `addr`.
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self::with_config(id, addr, DhtConfig::default())
    }

    /// Creates a node with explicit tunables.
    pub fn with_config(id: NodeId, addr: impl Into<String>, config: DhtConfig) -> Self {
        Self {
            id,
            listen_addr: RwLock::new(addr.into()),
            advertised_addr: RwLock::new(String::new()),
            relay_addr: RwLock::new(String::new()),
            rt: crate::RoutingTable::new(id, config.k),
            kv: RwLock::new(HashMap::new()),
            fail_counts: Mutex::new(HashMap::new()),
            block_provider: RwLock::new(None),
            config,
        }
    }

    /// Returns the node's tunables.
    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Installs the local block provider used to serve FETCH_BLOCK and
    /// accept PUT_BLOCK.
    pub fn set_block_provider(&self, provider: Arc<dyn BlockProvider>) {
        *self.block_provider.write() = Some(provider);
    }

    /// Overrides the address advertised to peers, typically the externally
    /// visible one learned via WHOAMI.
    pub fn set_advertised_addr(&self, addr: impl Into<String>) {
        *self.advertised_addr.write() = addr.into();
    }

    /// Returns the relay address this node is attached to, empty if none.
    pub fn relay_addr(&self) -> String {
        self.relay_addr.read().clone()
    }

    /// The contact other peers should use to reach this node.
    pub fn contact(&self) -> Contact {
        Contact {
            id: self.id,
            addr: self.dialable_addr(),
            relay: self.relay_addr(),
        }
    }

    pub(crate) fn dialable_addr(&self) -> String {
        let advertised = self.advertised_addr.read();
        if advertised.is_empty() {
            self.listen_addr.read().clone()
        } else {
            advertised.clone()
        }
    }

    /// Returns the routing table.
    pub fn routing_table(&self) -> &crate::RoutingTable {
        &self.rt
    }

    /// Returns the k closest known contacts to a target.
    pub fn closest_contacts(&self, target: &NodeId, k: usize) -> Vec<Contact> {
        self.rt.closest(target, k)
    }

    /// Inserts a record locally without replication.
    pub(crate) fn kv_insert(&self, key: &str, value: Vec<u8>, origin: bool) {
        let record = KvRecord {
            value,
            expires: Instant::now() + self.config.record_ttl,
            origin,
        };
        self.kv.write().insert(key.to_string(), record);
    }

    /// Returns an unexpired local value. Expired entries are left for the
    /// GC loop.
    pub(crate) fn kv_get(&self, key: &str) -> Option<Vec<u8>> {
        let kv = self.kv.read();
        let record = kv.get(key)?;
        if Instant::now() < record.expires {
            Some(record.value.clone())
        } else {
            None
        }
    }

    /// Removes a local record.
    pub(crate) fn kv_remove(&self, key: &str) {
        self.kv.write().remove(key);
    }

    /// Number of stored records, expired included.
    pub fn kv_len(&self) -> usize {
        self.kv.read().len()
    }

    /// Records an RPC failure against a contact: +2 on the score, eviction
    /// from the routing table at the threshold.
    pub fn on_rpc_failure(&self, contact: &Contact) {
        let key = contact.endpoint_key();
        let count = {
            let mut counts = self.fail_counts.lock();
            let entry = counts.entry(key.clone()).or_insert(0);
            *entry += 2;
            *entry
        };
        if count >= self.config.failure_threshold {
            self.rt.remove(contact);
            self.fail_counts.lock().remove(&key);
            debug!(peer = %contact.addr, "evicted failing contact");
        }
    }

    /// Clears the failure score of a contact after a successful RPC.
    pub fn on_rpc_success(&self, contact: &Contact) {
        self.fail_counts.lock().remove(&contact.endpoint_key());
    }

    /// Current failure score of a contact, for diagnostics and tests.
    pub fn failure_score(&self, contact: &Contact) -> u32 {
        self.fail_counts
            .lock()
            .get(&contact.endpoint_key())
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> Node {
        Node::new(NodeId::random(), "127.0.0.1:0")
    }

    fn contact(seed: u8) -> Contact {
        Contact {
            id: NodeId::new([seed; 32]),
            addr: format!("127.0.0.1:{}", 31000 + seed as u16),
            relay: String::new(),
        }
    }

    #[test]
    fn test_contact_prefers_advertised_addr() {
        let node = test_node();
        assert_eq!(node.contact().addr, "127.0.0.1:0");
        node.set_advertised_addr("198.51.100.7:30010");
        assert_eq!(node.contact().addr, "198.51.100.7:30010");
    }

    #[test]
    fn test_kv_roundtrip_and_expiry_gate() {
        let node = test_node();
        node.kv_insert("k", b"v".to_vec(), true);
        assert_eq!(node.kv_get("k").unwrap(), b"v");
        node.kv_remove("k");
        assert!(node.kv_get("k").is_none());
    }

    #[test]
    fn test_expired_record_not_returned() {
        let mut config = DhtConfig::default();
        config.record_ttl = std::time::Duration::ZERO;
        let node = Node::with_config(NodeId::random(), "127.0.0.1:0", config);
        node.kv_insert("k", b"v".to_vec(), false);
        assert!(node.kv_get("k").is_none());
        // still present until the GC loop sweeps it
        assert_eq!(node.kv_len(), 1);
    }

    #[test]
    fn test_failure_accounting_evicts_at_threshold() {
        let node = test_node();
        let c = contact(9);
        node.rt.update(c.clone());
        assert_eq!(node.rt.len(), 1);

        node.on_rpc_failure(&c);
        assert_eq!(node.failure_score(&c), 2);
        assert_eq!(node.rt.len(), 1);

        node.on_rpc_failure(&c);
        // score reached 4 >= 3: evicted and cleared
        assert_eq!(node.failure_score(&c), 0);
        assert!(node.rt.is_empty());
    }

    #[test]
    fn test_success_clears_failure_score() {
        let node = test_node();
        let c = contact(5);
        node.rt.update(c.clone());
        node.on_rpc_failure(&c);
        assert_eq!(node.failure_score(&c), 2);
        node.on_rpc_success(&c);
        assert_eq!(node.failure_score(&c), 0);
        assert_eq!(node.rt.len(), 1);
    }
}
