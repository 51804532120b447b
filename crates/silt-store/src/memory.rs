//! In-memory blockstore.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use silt_core::Cid;
use silt_proto::{child_cids, Block, BlockType};
use tracing::debug;

use crate::{BlockFetcher, PinMode, Store, StoreError, DEFAULT_SOFT_TTL};

#[derive(Default)]
struct MemInner {
    blocks: HashMap<Cid, Vec<u8>>,
    hard_pins: HashMap<Cid, PinMode>,
    soft_pins: HashMap<Cid, Instant>,
}

/// Blockstore keeping everything in process memory. Fetch results return
/// defensive copies; the single RwLock is never held across I/O.
pub struct MemStore {
    inner: RwLock<MemInner>,
    fetcher: Option<Arc<dyn BlockFetcher>>,
    soft_ttl: std::time::Duration,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Creates an empty store with no fetch path.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemInner::default()),
            fetcher: None,
            soft_ttl: DEFAULT_SOFT_TTL,
        }
    }

    /// Configures the network fetch path.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn BlockFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Overrides the soft pin TTL.
    pub fn with_soft_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.soft_ttl = ttl;
        self
    }

    fn refresh_soft_pin(&self, cid: &Cid) {
        let mut inner = self.inner.write();
        if inner.soft_pins.contains_key(cid) {
            let expiry = Instant::now() + self.soft_ttl;
            inner.soft_pins.insert(*cid, expiry);
        }
    }

    fn decode_verified(&self, cid: &Cid, raw: &[u8]) -> Result<Block, StoreError> {
        let block = Block::decode(raw)?;
        if block.cid != *cid {
            return Err(StoreError::Integrity("stored bytes CID mismatch".into()));
        }
        Ok(block)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn put_block(&self, block: &Block) -> Result<(), StoreError> {
        self.put_block_locally(block).await?;
        if let Some(fetcher) = &self.fetcher {
            fetcher.announce(&block.cid).await?;
        }
        Ok(())
    }

    async fn put_block_locally(&self, block: &Block) -> Result<(), StoreError> {
        self.inner
            .write()
            .blocks
            .insert(block.cid, block.bytes.clone());
        Ok(())
    }

    async fn get_block(&self, cid: &Cid) -> Result<Block, StoreError> {
        match self.get_block_local(cid).await {
            Ok(block) => Ok(block),
            Err(StoreError::NotFound) => {
                let Some(fetcher) = &self.fetcher else {
                    return Err(StoreError::NotFound);
                };
                // Any failure on the fetch path means the block is absent
                // everywhere we could reach.
                let Ok(raw) = fetcher.fetch_block(cid).await else {
                    return Err(StoreError::NotFound);
                };
                if raw.is_empty() {
                    return Err(StoreError::NotFound);
                }
                let block = self.decode_verified(cid, &raw)?;
                self.put_block_locally(&block).await?;
                self.pin_soft(cid).await?;
                // The cached copy is incidental and may be GC'd soon;
                // only manifests are worth advertising.
                if block.header.block_type == BlockType::Manifest {
                    let _ = fetcher.announce(cid).await;
                }
                Ok(block)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_block_local(&self, cid: &Cid) -> Result<Block, StoreError> {
        let raw = {
            let inner = self.inner.read();
            inner.blocks.get(cid).cloned()
        };
        let Some(raw) = raw else {
            return Err(StoreError::NotFound);
        };
        let block = self.decode_verified(cid, &raw)?;
        self.refresh_soft_pin(cid);
        Ok(block)
    }

    async fn pin(&self, cid: &Cid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.blocks.contains_key(cid) {
            return Err(StoreError::NotFound);
        }
        inner.hard_pins.insert(*cid, PinMode::Recursive);
        inner.soft_pins.remove(cid);
        Ok(())
    }

    async fn pin_direct(&self, cid: &Cid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.blocks.contains_key(cid) {
            return Err(StoreError::NotFound);
        }
        inner.hard_pins.insert(*cid, PinMode::Direct);
        inner.soft_pins.remove(cid);
        Ok(())
    }

    async fn pin_soft(&self, cid: &Cid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.hard_pins.contains_key(cid) {
            let expiry = Instant::now() + self.soft_ttl;
            inner.soft_pins.insert(*cid, expiry);
        }
        Ok(())
    }

    async fn unpin(&self, cid: &Cid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.hard_pins.remove(cid);
        inner.soft_pins.remove(cid);
        Ok(())
    }

    async fn list_pins(&self) -> Result<Vec<Cid>, StoreError> {
        Ok(self.inner.read().hard_pins.keys().copied().collect())
    }

    async fn gc(&self) -> Result<usize, StoreError> {
        // Snapshot roots and keys; traversal reads blocks without the lock.
        let (recursive_roots, mut live, all_keys) = {
            let inner = self.inner.read();
            let now = Instant::now();
            let recursive: Vec<Cid> = inner
                .hard_pins
                .iter()
                .filter(|(_, mode)| **mode == PinMode::Recursive)
                .map(|(c, _)| *c)
                .collect();
            let mut marked: HashSet<Cid> = inner
                .hard_pins
                .iter()
                .filter(|(_, mode)| **mode == PinMode::Direct)
                .map(|(c, _)| *c)
                .collect();
            marked.extend(
                inner
                    .soft_pins
                    .iter()
                    .filter(|(_, expiry)| now < **expiry)
                    .map(|(c, _)| *c),
            );
            let keys: Vec<Cid> = inner.blocks.keys().copied().collect();
            (recursive, marked, keys)
        };

        // DFS from recursive roots; direct and soft roots are marked but
        // never traversed.
        let mut stack = recursive_roots;
        while let Some(cid) = stack.pop() {
            if !live.insert(cid) {
                continue;
            }
            let Ok(block) = self.get_block_local(&cid).await else {
                continue;
            };
            let Ok(children) = child_cids(&block) else {
                continue;
            };
            for child in children {
                if !live.contains(&child) {
                    stack.push(child);
                }
            }
        }

        let mut freed = 0;
        let mut swept: Vec<Cid> = Vec::new();
        {
            let mut inner = self.inner.write();
            for cid in all_keys {
                if !live.contains(&cid) && inner.blocks.remove(&cid).is_some() {
                    freed += 1;
                    swept.push(cid);
                }
            }
        }
        if let Some(fetcher) = &self.fetcher {
            for cid in &swept {
                let _ = fetcher.unannounce(cid).await;
            }
        }
        if freed > 0 {
            debug!(freed, "memstore gc pass");
        }
        Ok(freed)
    }

    async fn stats(&self) -> Result<(usize, u64), StoreError> {
        let inner = self.inner.read();
        let bytes = inner.blocks.values().map(|b| b.len() as u64).sum();
        Ok((inner.blocks.len(), bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use silt_proto::{ManifestPayload, NodePayload, CODEC_CBOR, CODEC_RAW};
    use std::time::Duration;

    fn leaf(data: &[u8]) -> Block {
        Block::build(BlockType::Data, CODEC_RAW, data.to_vec()).unwrap()
    }

    /// Builds a two-leaf DAG by hand and returns (manifest, node, leaves).
    async fn tiny_dag(store: &MemStore) -> (Block, Block, Vec<Block>) {
        let a = leaf(b"aaaa");
        let b = leaf(b"bb");
        let np = NodePayload {
            v: 1,
            size: 6,
            fanout: 2,
            cids: vec![a.cid, b.cid],
            spans: vec![4, 2],
        };
        let node = Block::build(BlockType::Node, CODEC_CBOR, np.to_vec().unwrap()).unwrap();
        let mp = ManifestPayload {
            v: 1,
            size: 6,
            chunk: 4,
            fanout: 2,
            root: node.cid,
            name: "t".to_string(),
            mime: String::new(),
        };
        let manifest =
            Block::build(BlockType::Manifest, CODEC_CBOR, mp.to_vec().unwrap()).unwrap();
        for blk in [&a, &b, &node, &manifest] {
            store.put_block_locally(blk).await.unwrap();
        }
        (manifest, node, vec![a, b])
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemStore::new();
        let block = leaf(b"hello");
        store.put_block(&block).await.unwrap();
        let got = store.get_block(&block.cid).await.unwrap();
        assert_eq!(got.bytes, block.bytes);
    }

    #[tokio::test]
    async fn test_get_missing_without_fetcher() {
        let store = MemStore::new();
        assert!(matches!(
            store.get_block(&Cid::of(b"nope")).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_corrupted_bytes_detected() {
        let store = MemStore::new();
        let block = leaf(b"content");
        store.put_block_locally(&block).await.unwrap();
        {
            let mut inner = store.inner.write();
            let bytes = inner.blocks.get_mut(&block.cid).unwrap();
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
        }
        assert!(matches!(
            store.get_block_local(&block.cid).await,
            Err(StoreError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_recursive_pin_protects_dag() {
        let store = MemStore::new();
        let (manifest, node, leaves) = tiny_dag(&store).await;
        store.pin(&manifest.cid).await.unwrap();

        let freed = store.gc().await.unwrap();
        assert_eq!(freed, 0);
        for blk in [&manifest, &node, &leaves[0], &leaves[1]] {
            assert!(store.get_block_local(&blk.cid).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_unpin_then_gc_frees_dag() {
        let store = MemStore::new();
        let (manifest, _, _) = tiny_dag(&store).await;
        store.pin(&manifest.cid).await.unwrap();
        store.unpin(&manifest.cid).await.unwrap();

        let freed = store.gc().await.unwrap();
        assert_eq!(freed, 4);
        let (blocks, _) = store.stats().await.unwrap();
        assert_eq!(blocks, 0);
    }

    #[tokio::test]
    async fn test_direct_pin_keeps_only_itself() {
        let store = MemStore::new();
        let (manifest, node, leaves) = tiny_dag(&store).await;
        store.pin_direct(&manifest.cid).await.unwrap();

        let freed = store.gc().await.unwrap();
        assert_eq!(freed, 3);
        assert!(store.get_block_local(&manifest.cid).await.is_ok());
        assert!(store.get_block_local(&node.cid).await.is_err());
        assert!(store.get_block_local(&leaves[0].cid).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_subtree_survives_other_pin() {
        let store = MemStore::new();
        let (manifest, node, _) = tiny_dag(&store).await;
        store.pin(&manifest.cid).await.unwrap();
        // A second recursive pin on the inner node.
        store.pin(&node.cid).await.unwrap();
        store.unpin(&manifest.cid).await.unwrap();

        store.gc().await.unwrap();
        // Only the manifest itself is gone; node and leaves are co-owned.
        assert!(store.get_block_local(&manifest.cid).await.is_err());
        assert!(store.get_block_local(&node.cid).await.is_ok());
    }

    #[tokio::test]
    async fn test_soft_pin_expiry_and_refresh() {
        let store = MemStore::new().with_soft_ttl(Duration::from_millis(40));
        let block = leaf(b"cached");
        store.put_block_locally(&block).await.unwrap();
        store.pin_soft(&block.cid).await.unwrap();

        // Unexpired soft pin keeps the block.
        assert_eq!(store.gc().await.unwrap(), 0);

        // A read extends the expiry.
        tokio::time::sleep(Duration::from_millis(25)).await;
        store.get_block_local(&block.cid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.gc().await.unwrap(), 0);

        // Past the TTL the block is swept.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.gc().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hard_pin_overrides_soft() {
        let store = MemStore::new();
        let block = leaf(b"x");
        store.put_block_locally(&block).await.unwrap();
        store.pin_soft(&block.cid).await.unwrap();
        store.pin(&block.cid).await.unwrap();
        assert!(store.inner.read().soft_pins.is_empty());
        // soft pin on a hard-pinned cid is a no-op
        store.pin_soft(&block.cid).await.unwrap();
        assert!(store.inner.read().soft_pins.is_empty());
    }

    #[tokio::test]
    async fn test_pin_unknown_cid_rejected() {
        let store = MemStore::new();
        let absent = Cid::of(b"never stored");
        assert!(matches!(
            store.pin(&absent).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.pin_direct(&absent).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_pins_hard_only() {
        let store = MemStore::new();
        let a = leaf(b"a");
        let b = leaf(b"b");
        store.put_block_locally(&a).await.unwrap();
        store.put_block_locally(&b).await.unwrap();
        store.pin(&a.cid).await.unwrap();
        store.pin_soft(&b.cid).await.unwrap();
        let pins = store.list_pins().await.unwrap();
        assert_eq!(pins, vec![a.cid]);
    }

    struct CountingFetcher {
        announced: Mutex<Vec<Cid>>,
        unannounced: Mutex<Vec<Cid>>,
        serve: Mutex<HashMap<Cid, Vec<u8>>>,
    }

    #[async_trait]
    impl BlockFetcher for CountingFetcher {
        async fn fetch_block(&self, cid: &Cid) -> Result<Vec<u8>, StoreError> {
            self.serve
                .lock()
                .get(cid)
                .cloned()
                .ok_or(StoreError::NotFound)
        }

        async fn announce(&self, cid: &Cid) -> Result<(), StoreError> {
            self.announced.lock().push(*cid);
            Ok(())
        }

        async fn unannounce(&self, cid: &Cid) -> Result<(), StoreError> {
            self.unannounced.lock().push(*cid);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fetch_path_caches_and_soft_pins() {
        let block = leaf(b"remote bytes");
        let fetcher = Arc::new(CountingFetcher {
            announced: Mutex::new(Vec::new()),
            unannounced: Mutex::new(Vec::new()),
            serve: Mutex::new(HashMap::from([(block.cid, block.bytes.clone())])),
        });
        let store = MemStore::new().with_fetcher(fetcher.clone());

        let got = store.get_block(&block.cid).await.unwrap();
        assert_eq!(got.bytes, block.bytes);
        // cached locally under a soft pin
        assert!(store.inner.read().blocks.contains_key(&block.cid));
        assert!(store.inner.read().soft_pins.contains_key(&block.cid));
        // a data block is not announced on cache fill
        assert!(fetcher.announced.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_path_rejects_wrong_bytes() {
        let block = leaf(b"expected");
        let wrong = leaf(b"imposter");
        let fetcher = Arc::new(CountingFetcher {
            announced: Mutex::new(Vec::new()),
            unannounced: Mutex::new(Vec::new()),
            serve: Mutex::new(HashMap::from([(block.cid, wrong.bytes.clone())])),
        });
        let store = MemStore::new().with_fetcher(fetcher);

        assert!(matches!(
            store.get_block(&block.cid).await,
            Err(StoreError::Integrity(_))
        ));
        // nothing was cached
        assert!(!store.inner.read().blocks.contains_key(&block.cid));
    }

    #[tokio::test]
    async fn test_gc_unannounces_swept_blocks() {
        let fetcher = Arc::new(CountingFetcher {
            announced: Mutex::new(Vec::new()),
            unannounced: Mutex::new(Vec::new()),
            serve: Mutex::new(HashMap::new()),
        });
        let store = MemStore::new().with_fetcher(fetcher.clone());
        let block = leaf(b"ephemeral");
        store.put_block_locally(&block).await.unwrap();

        assert_eq!(store.gc().await.unwrap(), 1);
        assert_eq!(fetcher.unannounced.lock().as_slice(), &[block.cid]);
    }
}
