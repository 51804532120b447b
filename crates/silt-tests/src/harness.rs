//! Multi-node test network.
//!
//! Every node listens on an ephemeral local port, runs over an in-memory
//! blockstore with small chunking so tests exercise real multi-level
//! DAGs, and is torn down through its cancellation token when the
//! network drops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use silt_core::NodeId;
use silt_dht::{DhtConfig, Node};
use silt_service::Service;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Chunk size used by harness nodes.
pub const TEST_CHUNK_SIZE: usize = 4 * 1024;

/// Fan-out used by harness nodes.
pub const TEST_FANOUT: usize = 4;

/// One running node with its service stack.
pub struct TestNode {
    /// The service facade.
    pub service: Service,
    /// The bound listen address.
    pub addr: SocketAddr,
    /// Cancels this node's tasks.
    pub cancel: CancellationToken,
}

impl TestNode {
    /// Starts a node on an ephemeral port. Only the RPC server runs;
    /// maintenance loops stay off so tests are deterministic.
    pub async fn start() -> Self {
        let mut config = DhtConfig::default();
        config.rpc_timeout = Duration::from_secs(1);
        let node = Arc::new(Node::with_config(NodeId::random(), "127.0.0.1:0", config));
        let service =
            Service::with_mem_store(node.clone()).with_chunking(TEST_CHUNK_SIZE, TEST_FANOUT);
        let cancel = CancellationToken::new();
        let addr = node
            .start_server(cancel.clone())
            .await
            .expect("bind test node");
        Self {
            service,
            addr,
            cancel,
        }
    }

    /// The node behind the service.
    pub fn node(&self) -> &Arc<Node> {
        self.service.node()
    }

    /// Bootstraps this node against another.
    pub async fn bootstrap_to(&self, other: &TestNode) {
        self.service.bootstrap(&[other.addr.to_string()]).await;
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A network of test nodes bootstrapped in a chain: node i joins via
/// node i-1.
pub struct TestNetwork {
    /// The running nodes.
    pub nodes: Vec<TestNode>,
}

impl TestNetwork {
    /// Starts `count` nodes and chains their bootstraps.
    pub async fn chain(count: usize) -> Self {
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let node = TestNode::start().await;
            if i > 0 {
                node.bootstrap_to(&nodes[i - 1]).await;
            }
            nodes.push(node);
        }
        // Let bootstrap pings settle.
        sleep(Duration::from_millis(50)).await;
        info!(nodes = count, "test network up");
        Self { nodes }
    }

    /// Returns node `i`.
    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }
}
