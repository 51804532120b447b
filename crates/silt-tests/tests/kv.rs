//! Key/value replication across the overlay.

use std::sync::Arc;
use std::time::Duration;

use silt_core::NodeId;
use silt_dht::{DhtConfig, Node};
use silt_proto::{RpcKind, RpcMessage};
use silt_tests::{TestNetwork, TestNode};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_store_then_get_from_late_joiner() {
    let net = TestNetwork::chain(3).await;

    net.node(0)
        .service
        .put("shared-key", b"shared-value".to_vec())
        .await
        .unwrap();

    // A node that joins after the store holds no replica and must find
    // the value through the overlay.
    let late = TestNode::start().await;
    late.bootstrap_to(net.node(2)).await;
    sleep(Duration::from_millis(50)).await;

    let value = late.service.get("shared-key").await.unwrap();
    assert_eq!(value, b"shared-value");
}

#[tokio::test]
async fn test_get_on_origin_is_local() {
    let net = TestNetwork::chain(1).await;
    net.node(0)
        .service
        .put("mine", b"local".to_vec())
        .await
        .unwrap();
    // No peers exist, yet the origin sees its own write.
    assert_eq!(net.node(0).service.get("mine").await.unwrap(), b"local");
}

#[tokio::test]
async fn test_missing_key_not_found() {
    let net = TestNetwork::chain(2).await;
    assert!(net.node(1).service.get("never-stored").await.is_err());
}

#[tokio::test]
async fn test_oversize_value_acked_but_not_stored() {
    let mut config = DhtConfig::default();
    config.max_value_size = 16;
    config.rpc_timeout = Duration::from_secs(1);
    let receiver = Arc::new(Node::with_config(NodeId::random(), "127.0.0.1:0", config));
    let cancel = CancellationToken::new();
    let addr = receiver.start_server(cancel.clone()).await.unwrap();

    let sender = Arc::new(Node::new(NodeId::random(), "127.0.0.1:0"));
    let target = silt_proto::Contact {
        id: receiver.id,
        addr: addr.to_string(),
        relay: String::new(),
    };

    // One byte over the bound: the receiver acknowledges and drops it.
    let store = RpcMessage::new(RpcKind::Store, sender.contact())
        .with_key("big")
        .with_value(vec![0u8; 17]);
    let resp = sender.dial_rpc(&target, store).await.unwrap();
    assert_eq!(resp.kind, RpcKind::Store);

    let find = RpcMessage::new(RpcKind::FindValue, sender.contact()).with_key("big");
    let resp = sender.dial_rpc(&target, find).await.unwrap();
    assert!(!resp.found);

    // A value at the bound is stored.
    let store = RpcMessage::new(RpcKind::Store, sender.contact())
        .with_key("fits")
        .with_value(vec![0u8; 16]);
    sender.dial_rpc(&target, store).await.unwrap();
    let find = RpcMessage::new(RpcKind::FindValue, sender.contact()).with_key("fits");
    let resp = sender.dial_rpc(&target, find).await.unwrap();
    assert!(resp.found);

    cancel.cancel();
}

#[tokio::test]
async fn test_iterative_find_node_discovers_transitive_peers() {
    let net = TestNetwork::chain(4).await;

    // Node 3 only knows node 2 directly, but a lookup walks the chain.
    let found = net
        .node(3)
        .node()
        .iterative_find_node(net.node(0).node().id, 20)
        .await;
    assert!(
        found.iter().any(|c| c.id == net.node(0).node().id),
        "lookup did not discover the chain head"
    );
}

#[tokio::test]
async fn test_failure_eviction_after_peer_death() {
    let net = TestNetwork::chain(1).await;
    let victim = TestNode::start().await;
    let victim_contact = victim.node().contact();

    net.node(0).node().routing_table().update(victim_contact.clone());
    assert_eq!(net.node(0).node().routing_table().len(), 1);

    drop(victim);
    sleep(Duration::from_millis(50)).await;

    // Two failed pings push the score past the threshold.
    for _ in 0..2 {
        if net.node(0).node().ping(&victim_contact).await.is_err() {
            net.node(0).node().on_rpc_failure(&victim_contact);
        }
    }
    assert_eq!(net.node(0).node().routing_table().len(), 0);
}
