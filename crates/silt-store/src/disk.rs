//! On-disk blockstore.
//!
//! A RocksDB index maps three key families, each suffixed by the 34-byte
//! CID: `'b'|cid` block presence (value: relative payload path), `'p'|cid`
//! hard pin (value `r` or `d`), `'s'|cid` soft pin (value: big-endian i64
//! expiry seconds). Payloads live in `blocks/<cc>/<cc>/<cid>` files,
//! written as `*.tmp` then renamed so a crash affects only the temp file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, DB};
use silt_core::{Cid, CID_BYTES_LEN};
use silt_proto::{child_cids, Block, BlockType};
use tracing::debug;

use crate::{BlockFetcher, PinMode, Store, StoreError, DEFAULT_SOFT_TTL};

const BLOCK_PREFIX: u8 = b'b';
const PIN_PREFIX: u8 = b'p';
const SOFT_PREFIX: u8 = b's';

/// Blockstore backed by a RocksDB index and content-addressed files.
pub struct DiskStore {
    db: DB,
    base_dir: PathBuf,
    fetcher: Option<Arc<dyn BlockFetcher>>,
    soft_ttl: Duration,
}

fn keyed(prefix: u8, cid: &Cid) -> [u8; 1 + CID_BYTES_LEN] {
    let mut key = [0u8; 1 + CID_BYTES_LEN];
    key[0] = prefix;
    key[1..].copy_from_slice(&cid.to_bytes());
    key
}

fn cid_from_key(key: &[u8]) -> Result<Cid, StoreError> {
    if key.len() < 1 + CID_BYTES_LEN {
        return Err(StoreError::Database("bad index key length".into()));
    }
    Ok(Cid::from_bytes(&key[1..1 + CID_BYTES_LEN])
        .map_err(|e| StoreError::Database(e.to_string()))?)
}

fn encode_expiry(at: SystemTime) -> [u8; 8] {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    secs.to_be_bytes()
}

fn decode_expiry(raw: &[u8]) -> i64 {
    if raw.len() < 8 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[..8]);
    i64::from_be_bytes(bytes)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl DiskStore {
    /// Opens or creates a store rooted at `base_dir`; the index lives in
    /// `<base_dir>/index`.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, base_dir.join("index"))
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self {
            db,
            base_dir,
            fetcher: None,
            soft_ttl: DEFAULT_SOFT_TTL,
        })
    }

    /// Configures the network fetch path.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn BlockFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Overrides the soft pin TTL.
    pub fn with_soft_ttl(mut self, ttl: Duration) -> Self {
        self.soft_ttl = ttl;
        self
    }

    fn block_rel_path(cid: &Cid) -> PathBuf {
        let enc = cid.encode();
        // Skip the multibase prefix when fanning out directories.
        Path::new("blocks")
            .join(&enc[1..3])
            .join(&enc[3..5])
            .join(&enc)
    }

    fn db_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn db_put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db
            .put(key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn db_delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db
            .delete(key)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Collects `(key, value)` pairs of one key family.
    fn scan(&self, prefix: u8) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(&[prefix], Direction::Forward));
        for entry in iter {
            let (key, value) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.first() != Some(&prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn refresh_soft_pin(&self, cid: &Cid) -> Result<(), StoreError> {
        if self.db_get(&keyed(SOFT_PREFIX, cid))?.is_some() {
            let expiry = SystemTime::now() + self.soft_ttl;
            self.db_put(&keyed(SOFT_PREFIX, cid), &encode_expiry(expiry))?;
        }
        Ok(())
    }

    fn read_verified(&self, cid: &Cid) -> Result<Block, StoreError> {
        let Some(rel) = self.db_get(&keyed(BLOCK_PREFIX, cid))? else {
            return Err(StoreError::NotFound);
        };
        let rel = String::from_utf8_lossy(&rel).into_owned();
        let raw = std::fs::read(self.base_dir.join(rel)).map_err(|_| StoreError::NotFound)?;
        let block = Block::decode(&raw)?;
        if block.cid != *cid {
            return Err(StoreError::Integrity("stored bytes CID mismatch".into()));
        }
        Ok(block)
    }

    fn write_payload(&self, block: &Block) -> Result<(), StoreError> {
        let rel = Self::block_rel_path(&block.cid);
        let abs = self.base_dir.join(&rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = abs.with_extension("tmp");
        std::fs::write(&tmp, &block.bytes)?;
        std::fs::rename(&tmp, &abs)?;
        self.db_put(
            &keyed(BLOCK_PREFIX, &block.cid),
            rel.to_string_lossy().as_bytes(),
        )
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn put_block(&self, block: &Block) -> Result<(), StoreError> {
        self.put_block_locally(block).await?;
        if let Some(fetcher) = &self.fetcher {
            fetcher.announce(&block.cid).await?;
        }
        Ok(())
    }

    async fn put_block_locally(&self, block: &Block) -> Result<(), StoreError> {
        self.write_payload(block)
    }

    async fn get_block(&self, cid: &Cid) -> Result<Block, StoreError> {
        match self.get_block_local(cid).await {
            Ok(block) => Ok(block),
            Err(StoreError::NotFound) => {
                let Some(fetcher) = &self.fetcher else {
                    return Err(StoreError::NotFound);
                };
                let Ok(raw) = fetcher.fetch_block(cid).await else {
                    return Err(StoreError::NotFound);
                };
                if raw.is_empty() {
                    return Err(StoreError::NotFound);
                }
                let block = Block::decode(&raw)?;
                if block.cid != *cid {
                    return Err(StoreError::Integrity("fetched bytes CID mismatch".into()));
                }
                self.put_block_locally(&block).await?;
                self.pin_soft(cid).await?;
                if block.header.block_type == BlockType::Manifest {
                    let _ = fetcher.announce(cid).await;
                }
                Ok(block)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_block_local(&self, cid: &Cid) -> Result<Block, StoreError> {
        let block = self.read_verified(cid)?;
        self.refresh_soft_pin(cid)?;
        Ok(block)
    }

    async fn pin(&self, cid: &Cid) -> Result<(), StoreError> {
        if self.db_get(&keyed(BLOCK_PREFIX, cid))?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.db_delete(&keyed(SOFT_PREFIX, cid))?;
        self.db_put(&keyed(PIN_PREFIX, cid), b"r")
    }

    async fn pin_direct(&self, cid: &Cid) -> Result<(), StoreError> {
        if self.db_get(&keyed(BLOCK_PREFIX, cid))?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.db_delete(&keyed(SOFT_PREFIX, cid))?;
        self.db_put(&keyed(PIN_PREFIX, cid), b"d")
    }

    async fn pin_soft(&self, cid: &Cid) -> Result<(), StoreError> {
        if self.db_get(&keyed(PIN_PREFIX, cid))?.is_some() {
            return Ok(());
        }
        let expiry = SystemTime::now() + self.soft_ttl;
        self.db_put(&keyed(SOFT_PREFIX, cid), &encode_expiry(expiry))
    }

    async fn unpin(&self, cid: &Cid) -> Result<(), StoreError> {
        self.db_delete(&keyed(SOFT_PREFIX, cid))?;
        self.db_delete(&keyed(PIN_PREFIX, cid))
    }

    async fn list_pins(&self) -> Result<Vec<Cid>, StoreError> {
        let mut out = Vec::new();
        for (key, _) in self.scan(PIN_PREFIX)? {
            if let Ok(cid) = cid_from_key(&key) {
                out.push(cid);
            }
        }
        Ok(out)
    }

    async fn gc(&self) -> Result<usize, StoreError> {
        // Split the roots: recursive hard pins are traversed, direct hard
        // pins and unexpired soft pins are only marked.
        let mut recursive_roots: Vec<Cid> = Vec::new();
        let mut live: HashSet<Cid> = HashSet::new();
        for (key, value) in self.scan(PIN_PREFIX)? {
            let Ok(cid) = cid_from_key(&key) else { continue };
            let mode = match value.first() {
                Some(b'd') => PinMode::Direct,
                _ => PinMode::Recursive,
            };
            match mode {
                PinMode::Recursive => recursive_roots.push(cid),
                PinMode::Direct => {
                    live.insert(cid);
                }
            }
        }
        let now = now_secs();
        for (key, value) in self.scan(SOFT_PREFIX)? {
            if now < decode_expiry(&value) {
                if let Ok(cid) = cid_from_key(&key) {
                    live.insert(cid);
                }
            }
        }

        let all: Vec<(Cid, Vec<u8>, String)> = self
            .scan(BLOCK_PREFIX)?
            .into_iter()
            .filter_map(|(key, value)| {
                let cid = cid_from_key(&key).ok()?;
                let rel = String::from_utf8_lossy(&value).into_owned();
                Some((cid, key, rel))
            })
            .collect();

        let mut stack = recursive_roots;
        while let Some(cid) = stack.pop() {
            if !live.insert(cid) {
                continue;
            }
            let Ok(block) = self.read_verified(&cid) else {
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
        for (cid, key, rel) in all {
            if live.contains(&cid) {
                continue;
            }
            let _ = std::fs::remove_file(self.base_dir.join(rel));
            if self.db_delete(&key).is_ok() {
                freed += 1;
                if let Some(fetcher) = &self.fetcher {
                    let _ = fetcher.unannounce(&cid).await;
                }
            }
        }
        if freed > 0 {
            debug!(freed, "diskstore gc pass");
        }
        Ok(freed)
    }

    async fn stats(&self) -> Result<(usize, u64), StoreError> {
        let mut blocks = 0;
        let mut bytes = 0u64;
        for (_, value) in self.scan(BLOCK_PREFIX)? {
            let rel = String::from_utf8_lossy(&value).into_owned();
            if let Ok(meta) = std::fs::metadata(self.base_dir.join(rel)) {
                bytes += meta.len();
            }
            blocks += 1;
        }
        Ok((blocks, bytes))
    }
}
