//! Bottom-up DAG construction.

use std::sync::Arc;

use silt_core::Cid;
use silt_proto::{Block, BlockType, ManifestPayload, NodePayload, CODEC_CBOR, CODEC_RAW};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::{BlockSink, DagError, DEFAULT_CHUNK_SIZE, DEFAULT_FANOUT};

/// Builds Merkle DAGs from byte streams and stores every block through the
/// configured sink before returning the manifest.
pub struct DagBuilder {
    /// Leaf chunk size in bytes. Must be positive.
    pub chunk_size: usize,
    /// Maximum children per internal node. Must be at least 2.
    pub fanout: usize,
    store: Arc<dyn BlockSink>,
}

/// A `(cid, span)` pair for one finished level entry.
struct Entry {
    cid: Cid,
    span: u64,
}

impl DagBuilder {
    /// Creates a builder with default chunking parameters.
    pub fn new(store: Arc<dyn BlockSink>) -> Self {
        Self::with_params(store, DEFAULT_CHUNK_SIZE, DEFAULT_FANOUT)
    }

    /// Creates a builder with explicit chunk size and fan-out.
    pub fn with_params(store: Arc<dyn BlockSink>, chunk_size: usize, fanout: usize) -> Self {
        Self {
            chunk_size,
            fanout,
            store,
        }
    }

    /// Returns a builder with the same parameters writing to a different sink.
    pub fn with_store(&self, store: Arc<dyn BlockSink>) -> Self {
        Self {
            chunk_size: self.chunk_size,
            fanout: self.fanout,
            store,
        }
    }

    /// Ingests the reader, builds the DAG bottom-up, stores all blocks and
    /// returns the manifest block and its CID.
    ///
    /// An empty stream is represented by a single zero-length Data leaf.
    pub async fn build_from_reader<R>(
        &self,
        name: &str,
        mime: &str,
        mut reader: R,
    ) -> Result<(Block, Cid), DagError>
    where
        R: AsyncRead + Unpin,
    {
        if self.chunk_size == 0 || self.fanout < 2 {
            return Err(DagError::InvalidParams);
        }

        let mut level: Vec<Entry> = Vec::new();
        let mut total: u64 = 0;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = read_full(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            let leaf = Block::build(BlockType::Data, CODEC_RAW, buf[..n].to_vec())?;
            self.store.put_block(&leaf).await?;
            level.push(Entry {
                cid: leaf.cid,
                span: n as u64,
            });
            total += n as u64;
            if n < self.chunk_size {
                break;
            }
        }

        if level.is_empty() {
            let empty = Block::build(BlockType::Data, CODEC_RAW, Vec::new())?;
            self.store.put_block(&empty).await?;
            level.push(Entry {
                cid: empty.cid,
                span: 0,
            });
        }
        let leaves = level.len();

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(self.fanout));
            for group in level.chunks(self.fanout) {
                let node_size: u64 = group.iter().map(|e| e.span).sum();
                let payload = NodePayload {
                    v: 1,
                    size: node_size,
                    fanout: self.fanout as u16,
                    cids: group.iter().map(|e| e.cid).collect(),
                    spans: group.iter().map(|e| e.span).collect(),
                };
                let node = Block::build(BlockType::Node, CODEC_CBOR, payload.to_vec()?)?;
                self.store.put_block(&node).await?;
                next.push(Entry {
                    cid: node.cid,
                    span: node_size,
                });
            }
            level = next;
        }

        let root = &level[0];
        let manifest_payload = ManifestPayload {
            v: 1,
            size: total,
            chunk: self.chunk_size as u32,
            fanout: self.fanout as u16,
            root: root.cid,
            name: name.to_string(),
            mime: mime.to_string(),
        };
        let manifest = Block::build(BlockType::Manifest, CODEC_CBOR, manifest_payload.to_vec()?)?;
        self.store.put_block(&manifest).await?;

        debug!(cid = %manifest.cid, size = total, leaves, "built dag");
        let cid = manifest.cid;
        Ok((manifest, cid))
    }
}

/// Fills `buf` from the reader, returning the number of bytes read.
/// Returns less than `buf.len()` only at end of stream.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, DagError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| DagError::Store(e.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
