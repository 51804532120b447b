//! RPC server side: TCP listener and the request handler shared with the
//! relay delivery path.

use std::net::SocketAddr;
use std::sync::Arc;

use silt_core::{hash_key, Cid, NodeId};
use silt_proto::{Block, RpcKind, RpcMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::node::Node;
use crate::DhtError;

impl Node {
    /// Binds the listener, records the actual bound address, and spawns
    /// the accept loop. Returns the bound address. Shutdown via the token
    /// produces no error; the closing flag suppresses the accept failure.
    pub async fn start_server(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<SocketAddr, DhtError> {
        let addr = self.listen_addr.read().clone();
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        *self.listen_addr.write() = local.to_string();
        info!(id = %&self.id.to_hex()[..8], addr = %local, "node listening");

        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("node server stopped");
                        return;
                    }
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { return };
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            let _ = node.handle_conn(stream).await;
                        });
                    }
                }
            }
        });
        Ok(local)
    }

    /// Serves one request/response exchange, then closes.
    async fn handle_conn(self: &Arc<Self>, stream: TcpStream) -> Result<(), DhtError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        // Bad request shape: drop the message, close the connection cleanly.
        let Ok(req) = serde_json::from_str::<RpcMessage>(line.trim_end()) else {
            return Ok(());
        };

        if let Some(resp) = self.handle_request(req).await {
            let mut out = serde_json::to_vec(&resp)?;
            out.push(b'\n');
            write_half.write_all(&out).await?;
        }
        Ok(())
    }

    /// The single request handler used identically for direct TCP and
    /// relay delivery. Every request first feeds the sender's contact
    /// into the routing table. `None` means the request was dropped.
    pub async fn handle_request(&self, req: RpcMessage) -> Option<RpcMessage> {
        self.rt.update(req.from.clone());
        trace!(kind = ?req.kind, from = %req.from.addr, key = %req.key, "handling rpc");

        match req.kind {
            RpcKind::Ping => Some(RpcMessage::new(RpcKind::Ping, self.contact())),

            RpcKind::Store => {
                if req.key.is_empty() {
                    return None;
                }
                // Oversize values are silently acknowledged, not stored.
                if req.value.len() <= self.config.max_value_size {
                    self.kv_insert(&req.key, req.value, false);
                }
                Some(RpcMessage::new(RpcKind::Store, self.contact()))
            }

            RpcKind::FindNode => {
                let target = NodeId::from_hex(&req.key).unwrap_or_default();
                let nodes = self.rt.closest(&target, self.config.k);
                Some(RpcMessage::new(RpcKind::FindNode, self.contact()).with_nodes(nodes))
            }

            RpcKind::FindValue => {
                if req.key.is_empty() {
                    return None;
                }
                if let Some(value) = self.kv_get(&req.key) {
                    return Some(
                        RpcMessage::new(RpcKind::FindValue, self.contact())
                            .with_value(value)
                            .found(),
                    );
                }
                // Drop an expired entry before answering with closer nodes.
                if self.kv.read().contains_key(&req.key) {
                    self.kv_remove(&req.key);
                }
                let nodes = self.rt.closest(&hash_key(&req.key), self.config.k);
                Some(RpcMessage::new(RpcKind::FindValue, self.contact()).with_nodes(nodes))
            }

            RpcKind::FetchBlock => {
                if req.key.is_empty() {
                    return None;
                }
                let Ok(cid) = Cid::decode(&req.key) else {
                    return None;
                };
                let provider = self.block_provider.read().clone();
                let Some(provider) = provider else {
                    return Some(RpcMessage::new(RpcKind::FetchBlock, self.contact()));
                };
                match provider.get_block_local(&cid).await {
                    Some(block) => Some(
                        RpcMessage::new(RpcKind::FetchBlock, self.contact())
                            .with_value(block.bytes)
                            .found(),
                    ),
                    None => Some(RpcMessage::new(RpcKind::FetchBlock, self.contact())),
                }
            }

            RpcKind::PutBlock => {
                if req.key.is_empty() {
                    return None;
                }
                let accepted = self.accept_block(&req.key, &req.value).await;
                let resp = RpcMessage::new(RpcKind::PutBlock, self.contact());
                Some(if accepted { resp.found() } else { resp })
            }
        }
    }

    /// Validates and stores a pushed block: foreign blocks must be
    /// enabled, the bytes must fit the size bound, and the recomputed CID
    /// must match the key.
    async fn accept_block(&self, key: &str, value: &[u8]) -> bool {
        if !self.config.accept_foreign_blocks {
            return false;
        }
        if value.is_empty() || value.len() > self.config.max_block_size {
            return false;
        }
        let Ok(claimed) = Cid::decode(key) else {
            return false;
        };
        let Ok(block) = Block::decode(value) else {
            return false;
        };
        if block.cid != claimed {
            return false;
        }
        let provider = self.block_provider.read().clone();
        match provider {
            Some(provider) => provider.put_foreign_block(block).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockProvider, DhtConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use silt_proto::{BlockType, Contact};
    use std::collections::HashMap;

    struct MapProvider {
        blocks: Mutex<HashMap<Cid, Block>>,
    }

    impl MapProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                blocks: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl BlockProvider for MapProvider {
        async fn get_block_local(&self, cid: &Cid) -> Option<Block> {
            self.blocks.lock().get(cid).cloned()
        }

        async fn put_foreign_block(&self, block: Block) -> bool {
            self.blocks.lock().insert(block.cid, block);
            true
        }
    }

    fn node() -> Node {
        Node::new(NodeId::random(), "127.0.0.1:0")
    }

    fn peer_contact(seed: u8) -> Contact {
        Contact {
            id: NodeId::new([seed; 32]),
            addr: format!("127.0.0.1:{}", 33000 + seed as u16),
            relay: String::new(),
        }
    }

    #[tokio::test]
    async fn test_ping_updates_routing_table() {
        let n = node();
        let resp = n
            .handle_request(RpcMessage::new(RpcKind::Ping, peer_contact(1)))
            .await
            .unwrap();
        assert_eq!(resp.kind, RpcKind::Ping);
        assert_eq!(resp.from.id, n.id);
        assert_eq!(n.rt.len(), 1);
    }

    #[tokio::test]
    async fn test_store_and_find_value() {
        let n = node();
        let store = RpcMessage::new(RpcKind::Store, peer_contact(1))
            .with_key("k")
            .with_value(b"v".to_vec());
        n.handle_request(store).await.unwrap();

        let find = RpcMessage::new(RpcKind::FindValue, peer_contact(2)).with_key("k");
        let resp = n.handle_request(find).await.unwrap();
        assert!(resp.found);
        assert_eq!(resp.value, b"v");
    }

    #[tokio::test]
    async fn test_oversize_store_silently_acked() {
        let mut config = DhtConfig::default();
        config.max_value_size = 8;
        let n = Node::with_config(NodeId::random(), "127.0.0.1:0", config);
        let store = RpcMessage::new(RpcKind::Store, peer_contact(1))
            .with_key("big")
            .with_value(vec![0u8; 9]);
        let resp = n.handle_request(store).await.unwrap();
        assert_eq!(resp.kind, RpcKind::Store);
        assert!(n.kv_get("big").is_none());
    }

    #[tokio::test]
    async fn test_empty_key_store_dropped() {
        let n = node();
        let store = RpcMessage::new(RpcKind::Store, peer_contact(1)).with_value(b"v".to_vec());
        assert!(n.handle_request(store).await.is_none());
    }

    #[tokio::test]
    async fn test_find_value_miss_returns_nodes() {
        let n = node();
        n.rt.update(peer_contact(3));
        let find = RpcMessage::new(RpcKind::FindValue, peer_contact(2)).with_key("absent");
        let resp = n.handle_request(find).await.unwrap();
        assert!(!resp.found);
        // the requester itself was added to the table before dispatch
        assert!(!resp.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_find_node_returns_closest() {
        let n = node();
        for seed in 1..5 {
            n.rt.update(peer_contact(seed));
        }
        let target = NodeId::new([1; 32]);
        let find = RpcMessage::new(RpcKind::FindNode, peer_contact(9)).with_key(target.to_hex());
        let resp = n.handle_request(find).await.unwrap();
        assert!(!resp.nodes.is_empty());
        assert_eq!(resp.nodes[0].id, NodeId::new([1; 32]));
    }

    #[tokio::test]
    async fn test_fetch_block_local_hit_and_miss() {
        let n = node();
        let provider = MapProvider::new();
        n.set_block_provider(provider.clone());

        let block = Block::build(BlockType::Data, "raw", b"bytes".to_vec()).unwrap();
        provider.put_foreign_block(block.clone()).await;

        let hit = RpcMessage::new(RpcKind::FetchBlock, peer_contact(1))
            .with_key(block.cid.encode());
        let resp = n.handle_request(hit).await.unwrap();
        assert!(resp.found);
        assert_eq!(resp.value, block.bytes);

        let miss = RpcMessage::new(RpcKind::FetchBlock, peer_contact(1))
            .with_key(Cid::of(b"other").encode());
        let resp = n.handle_request(miss).await.unwrap();
        assert!(!resp.found);
    }

    #[tokio::test]
    async fn test_put_block_validates_cid() {
        let n = node();
        let provider = MapProvider::new();
        n.set_block_provider(provider.clone());

        let block = Block::build(BlockType::Data, "raw", b"pushed".to_vec()).unwrap();

        // wrong key: rejected
        let bad = RpcMessage::new(RpcKind::PutBlock, peer_contact(1))
            .with_key(Cid::of(b"not it").encode())
            .with_value(block.bytes.clone());
        assert!(!n.handle_request(bad).await.unwrap().found);

        // matching key: accepted and stored
        let good = RpcMessage::new(RpcKind::PutBlock, peer_contact(1))
            .with_key(block.cid.encode())
            .with_value(block.bytes.clone());
        assert!(n.handle_request(good).await.unwrap().found);
        assert!(provider.get_block_local(&block.cid).await.is_some());
    }

    #[tokio::test]
    async fn test_put_block_respects_accept_flag() {
        let mut config = DhtConfig::default();
        config.accept_foreign_blocks = false;
        let n = Node::with_config(NodeId::random(), "127.0.0.1:0", config);
        n.set_block_provider(MapProvider::new());

        let block = Block::build(BlockType::Data, "raw", b"pushed".to_vec()).unwrap();
        let req = RpcMessage::new(RpcKind::PutBlock, peer_contact(1))
            .with_key(block.cid.encode())
            .with_value(block.bytes);
        assert!(!n.handle_request(req).await.unwrap().found);
    }
}
