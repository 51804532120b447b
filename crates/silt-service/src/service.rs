//! The service facade and its maintenance loops.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use silt_core::{Cid, NodeId};
use silt_dag::{BlockSource, DagBuilder};
use silt_dht::Node;
use silt_proto::{BlockType, Contact, ManifestPayload};
use silt_store::{DagStore, DiskStore, MemStore, Store, StoreError};
use tokio::io::AsyncRead;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetcher::ProviderFetcher;
use crate::provider::NodeBlockProvider;
use crate::{
    dist::{keep_local_selector, DistStore},
    ServiceError, DEFAULT_BLOCKSTORE_GC_INTERVAL, DEFAULT_KEEP_LOCAL_FRACTION,
    DEFAULT_REPROVIDE_INTERVAL,
};

/// User-visible metadata for a pinned manifest.
#[derive(Debug, Clone)]
pub struct PinInfo {
    /// Textual CID of the manifest.
    pub cid: String,
    /// File name recorded in the manifest.
    pub name: String,
    /// Total file size.
    pub size: u64,
    /// MIME type recorded in the manifest.
    pub mime: String,
}

/// Composes a node, a blockstore and a DAG builder into the operations
/// the daemon and tests drive.
pub struct Service {
    node: Arc<Node>,
    store: Arc<dyn Store>,
    builder: DagBuilder,
}

impl Service {
    /// Builds a service over an in-memory blockstore.
    pub fn with_mem_store(node: Arc<Node>) -> Self {
        let fetcher = Arc::new(ProviderFetcher::new(node.clone()));
        let store: Arc<dyn Store> = Arc::new(MemStore::new().with_fetcher(fetcher));
        Self::compose(node, store)
    }

    /// Builds a service over an on-disk blockstore rooted at `path`.
    pub fn with_disk_store(node: Arc<Node>, path: &Path) -> Result<Self, StoreError> {
        let fetcher = Arc::new(ProviderFetcher::new(node.clone()));
        let store: Arc<dyn Store> = Arc::new(DiskStore::open(path)?.with_fetcher(fetcher));
        Ok(Self::compose(node, store))
    }

    fn compose(node: Arc<Node>, store: Arc<dyn Store>) -> Self {
        node.set_block_provider(Arc::new(NodeBlockProvider::new(store.clone())));
        let builder = DagBuilder::new(Arc::new(DagStore(store.clone())));
        Self {
            node,
            store,
            builder,
        }
    }

    /// Overrides the builder's chunk size and fan-out.
    pub fn with_chunking(mut self, chunk_size: usize, fanout: usize) -> Self {
        self.builder.chunk_size = chunk_size;
        self.builder.fanout = fanout;
        self
    }

    /// Returns the underlying node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Returns the underlying blockstore.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The local node id.
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// The contact advertised to peers.
    pub fn contact(&self) -> Contact {
        self.node.contact()
    }

    /// Stores a raw key/value pair on the overlay.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ServiceError> {
        Ok(self.node.store(key, value).await?)
    }

    /// Looks a raw key up on the overlay.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        Ok(self.node.get(key).await?)
    }

    /// Adds a file wholly into the local blockstore and returns the
    /// manifest's textual CID.
    pub async fn add_from_path(&self, path: &Path) -> Result<String, ServiceError> {
        let (name, mime) = name_and_mime(path);
        let file = tokio::fs::File::open(path).await?;
        self.add_reader(&name, &mime, file).await
    }

    /// Adds a byte stream into the local blockstore.
    pub async fn add_reader<R: AsyncRead + Unpin>(
        &self,
        name: &str,
        mime: &str,
        reader: R,
    ) -> Result<String, ServiceError> {
        let (_, cid) = self.builder.build_from_reader(name, mime, reader).await?;
        Ok(cid.encode())
    }

    /// Adds a file, distributing blocks across CID-close peers instead of
    /// storing everything locally. The manifest and a sampled fraction of
    /// other blocks stay local.
    pub async fn add_from_path_distributed(&self, path: &Path) -> Result<String, ServiceError> {
        let (name, mime) = name_and_mime(path);
        let file = tokio::fs::File::open(path).await?;
        self.add_reader_distributed(&name, &mime, file).await
    }

    /// Distributed variant of [`Service::add_reader`].
    pub async fn add_reader_distributed<R: AsyncRead + Unpin>(
        &self,
        name: &str,
        mime: &str,
        reader: R,
    ) -> Result<String, ServiceError> {
        let dist = DistStore::new(
            self.node.clone(),
            self.store.clone(),
            self.node.config().replicas,
            Some(keep_local_selector(true, DEFAULT_KEEP_LOCAL_FRACTION)),
        );
        let builder = self.builder.with_store(Arc::new(dist));
        let (_, cid) = builder.build_from_reader(name, mime, reader).await?;
        Ok(cid.encode())
    }

    /// Reconstructs a file's bytes from its manifest CID, pulling missing
    /// blocks from providers.
    pub async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>, ServiceError> {
        let source: Arc<dyn BlockSource> = Arc::new(DagStore(self.store.clone()));
        Ok(silt_dag::fetch_parallel(source, cid, 16).await?)
    }

    /// Verifies the full DAG under a manifest CID.
    pub async fn verify(&self, cid: &Cid) -> Result<(), ServiceError> {
        let source = DagStore(self.store.clone());
        Ok(silt_dag::verify(&source, cid).await?)
    }

    /// Hard-pins a CID recursively.
    pub async fn pin(&self, cid: &Cid) -> Result<(), ServiceError> {
        Ok(self.store.pin(cid).await?)
    }

    /// Removes pins for a CID.
    pub async fn unpin(&self, cid: &Cid) -> Result<(), ServiceError> {
        Ok(self.store.unpin(cid).await?)
    }

    /// Lists pinned manifests with their metadata. Non-manifest pins are
    /// not user-visible and are skipped.
    pub async fn list_pins(&self) -> Result<Vec<PinInfo>, ServiceError> {
        let cids = self.store.list_pins().await?;
        let mut out = Vec::with_capacity(cids.len());
        for cid in cids {
            let Ok(block) = self.store.get_block(&cid).await else {
                continue;
            };
            if block.header.block_type != BlockType::Manifest {
                continue;
            }
            let Ok(mp) = ManifestPayload::from_slice(&block.payload) else {
                continue;
            };
            out.push(PinInfo {
                cid: cid.encode(),
                name: mp.name,
                size: mp.size,
                mime: mp.mime,
            });
        }
        Ok(out)
    }

    /// Resolves a manifest CID to `(name, mime, size)`.
    pub async fn manifest_meta(&self, cid: &Cid) -> Result<(String, String, u64), ServiceError> {
        let block = self.store.get_block(cid).await?;
        if block.header.block_type != BlockType::Manifest {
            return Err(ServiceError::NotManifest);
        }
        let mp = ManifestPayload::from_slice(&block.payload)
            .map_err(|e| ServiceError::Store(StoreError::Codec(e)))?;
        Ok((mp.name, mp.mime, mp.size))
    }

    /// Runs a blockstore GC pass. Returns the number of blocks freed.
    pub async fn gc(&self) -> Result<usize, ServiceError> {
        Ok(self.store.gc().await?)
    }

    /// Returns `(blocks, bytes)` held by the blockstore.
    pub async fn stats(&self) -> Result<(usize, u64), ServiceError> {
        Ok(self.store.stats().await?)
    }

    /// Seeds the routing table from known peers.
    pub async fn bootstrap(&self, peers: &[String]) {
        self.node.bootstrap(peers).await;
    }

    /// Starts everything: the RPC listener, external-address discovery
    /// and relay attachment when a relay is configured, bootstrap, the
    /// node maintenance loops, the reprovider and the blockstore GC.
    pub async fn start(
        &self,
        cancel: CancellationToken,
        relay_addr: Option<&str>,
        bootstrap_peers: &[String],
    ) -> Result<std::net::SocketAddr, ServiceError> {
        let local = self.node.start_server(cancel.clone()).await?;

        if let Some(relay) = relay_addr {
            match self.node.whoami(relay).await {
                Ok(host) if !host.is_empty() => {
                    let advertised = format!("{}:{}", host, local.port());
                    info!(addr = %advertised, "advertising external address");
                    self.node.set_advertised_addr(advertised);
                }
                Ok(_) => {}
                Err(e) => warn!(relay, error = %e, "whoami failed"),
            }

            let node = self.node.clone();
            let relay = relay.to_string();
            let attach_cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = node.attach_relay(attach_cancel, &relay).await {
                    warn!(relay, error = %e, "relay attachment ended");
                }
            });
            // Give the REGISTER frame a moment before peers try to reach
            // us through the relay.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if !bootstrap_peers.is_empty() {
            self.node.bootstrap(bootstrap_peers).await;
        }

        self.node.start_maintenance(cancel.clone());
        self.start_reprovider(cancel.clone(), DEFAULT_REPROVIDE_INTERVAL);
        self.start_blockstore_gc(cancel, DEFAULT_BLOCKSTORE_GC_INTERVAL);
        Ok(local)
    }

    /// Spawns the reprovider: one pass right away, then one per interval.
    /// Each pass walks all pinned DAG roots and republishes a provider
    /// record for every locally present block.
    pub fn start_reprovider(&self, cancel: CancellationToken, every: Duration) {
        let node = self.node.clone();
        let store = self.store.clone();
        info!(interval = ?every, "reprovider loop starting");
        tokio::spawn(async move {
            reprovide_once(&node, &store).await;
            let mut tick = interval(every);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("reprovider loop stopped");
                        return;
                    }
                    _ = tick.tick() => reprovide_once(&node, &store).await,
                }
            }
        });
    }

    /// Spawns the periodic blockstore GC.
    pub fn start_blockstore_gc(&self, cancel: CancellationToken, every: Duration) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("blockstore gc loop stopped");
                        return;
                    }
                    _ = tick.tick() => {
                        match store.gc().await {
                            Ok(freed) if freed > 0 => info!(freed, "blockstore gc"),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "blockstore gc failed"),
                        }
                    }
                }
            }
        });
    }
}

/// One reprovider pass over every pinned DAG.
async fn reprovide_once(node: &Arc<Node>, store: &Arc<dyn Store>) {
    let start = std::time::Instant::now();
    let pins = match store.list_pins().await {
        Ok(pins) => pins,
        Err(e) => {
            warn!(error = %e, "reprovide: list pins failed");
            return;
        }
    };

    let mut visited: std::collections::HashSet<Cid> = std::collections::HashSet::new();
    let mut announced = 0usize;
    for root in &pins {
        let mut stack = vec![*root];
        while let Some(cid) = stack.pop() {
            if !visited.insert(cid) {
                continue;
            }
            let Ok(block) = store.get_block_local(&cid).await else {
                continue;
            };
            if node.put_provider_record(&cid).await.is_ok() {
                announced += 1;
            }
            if let Ok(children) = silt_proto::child_cids(&block) {
                stack.extend(children);
            }
            // Pace the walk so a large pin set does not monopolize the node.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    debug!(
        pins = pins.len(),
        visited = visited.len(),
        announced,
        elapsed = ?start.elapsed(),
        "reprovide pass"
    );
}

/// Derives the logical name and MIME type for a path. Unknown extensions
/// fall back to `application/octet-stream`.
fn name_and_mime(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "file".to_string());
    let mime = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();
    (name, mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Service {
        let node = Arc::new(Node::new(NodeId::random(), "127.0.0.1:0"));
        Service::with_mem_store(node)
    }

    #[tokio::test]
    async fn test_add_fetch_roundtrip() {
        let svc = service();
        let cid_str = svc
            .add_reader("greeting.txt", "text/plain", &b"hello service"[..])
            .await
            .unwrap();
        let cid = Cid::decode(&cid_str).unwrap();
        assert_eq!(svc.fetch(&cid).await.unwrap(), b"hello service");
        svc.verify(&cid).await.unwrap();
    }

    #[tokio::test]
    async fn test_manifest_meta() {
        let svc = service();
        let cid_str = svc
            .add_reader("doc.txt", "text/plain", &b"0123456789"[..])
            .await
            .unwrap();
        let cid = Cid::decode(&cid_str).unwrap();
        let (name, mime, size) = svc.manifest_meta(&cid).await.unwrap();
        assert_eq!(name, "doc.txt");
        assert_eq!(mime, "text/plain");
        assert_eq!(size, 10);
    }

    #[tokio::test]
    async fn test_list_pins_shows_manifests_only() {
        let svc = service();
        let cid_str = svc
            .add_reader("keep.bin", "application/octet-stream", &[0u8; 64][..])
            .await
            .unwrap();
        let cid = Cid::decode(&cid_str).unwrap();
        svc.pin(&cid).await.unwrap();

        let pins = svc.list_pins().await.unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].cid, cid_str);
        assert_eq!(pins[0].name, "keep.bin");
        assert_eq!(pins[0].size, 64);
    }

    #[tokio::test]
    async fn test_pin_gc_cycle() {
        let svc = service();
        let cid_str = svc
            .add_reader("data", "", &[7u8; 4096][..])
            .await
            .unwrap();
        let cid = Cid::decode(&cid_str).unwrap();

        svc.pin(&cid).await.unwrap();
        assert_eq!(svc.gc().await.unwrap(), 0);
        svc.verify(&cid).await.unwrap();

        svc.unpin(&cid).await.unwrap();
        let freed = svc.gc().await.unwrap();
        assert!(freed > 0);
        assert!(svc.verify(&cid).await.is_err());
        let (blocks, _) = svc.stats().await.unwrap();
        assert_eq!(blocks, 0);
    }

    #[tokio::test]
    async fn test_local_kv_roundtrip() {
        let svc = service();
        svc.put("the-key", b"the-value".to_vec()).await.unwrap();
        assert_eq!(svc.get("the-key").await.unwrap(), b"the-value");
    }

    #[test]
    fn test_name_and_mime() {
        let (name, mime) = name_and_mime(Path::new("/tmp/report.json"));
        assert_eq!(name, "report.json");
        assert_eq!(mime, "application/json");

        let (name, mime) = name_and_mime(Path::new("/tmp/blob.unknownext"));
        assert_eq!(name, "blob.unknownext");
        assert_eq!(mime, "application/octet-stream");
    }
}
