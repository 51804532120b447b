//! Recursive DAG verification.

use std::future::Future;
use std::pin::Pin;

use silt_core::Cid;
use silt_proto::{BlockType, ManifestPayload, NodePayload};

use crate::{BlockSource, DagError};

/// Verifies that the full DAG under a manifest is retrievable and that
/// every block's bytes, span and shape match what its parent declared.
pub async fn verify(store: &dyn BlockSource, manifest_cid: &Cid) -> Result<(), DagError> {
    let manifest = store.get_block(manifest_cid).await?;
    if manifest.header.block_type != BlockType::Manifest {
        return Err(DagError::NotManifest);
    }
    let mp = ManifestPayload::from_slice(&manifest.payload)?;
    verify_subtree(store, mp.root, mp.size).await
}

fn verify_subtree<'a>(
    store: &'a dyn BlockSource,
    cid: Cid,
    expect_span: u64,
) -> Pin<Box<dyn Future<Output = Result<(), DagError>> + Send + 'a>> {
    Box::pin(async move {
        let block = store.get_block(&cid).await?;
        if block.cid != cid {
            return Err(DagError::Integrity("CID mismatch: corrupted data".into()));
        }
        match block.header.block_type {
            BlockType::Data => {
                if block.payload.len() as u64 != expect_span {
                    return Err(DagError::Integrity(format!(
                        "leaf span mismatch: have {} expect {}",
                        block.payload.len(),
                        expect_span
                    )));
                }
                Ok(())
            }
            BlockType::Node => {
                let np = NodePayload::from_slice(&block.payload)?;
                if np.size != expect_span {
                    return Err(DagError::Integrity(format!(
                        "node size mismatch: have {} expect {}",
                        np.size, expect_span
                    )));
                }
                if np.cids.len() != np.spans.len() {
                    return Err(DagError::Integrity(
                        "node malformed: cids/spans length mismatch".into(),
                    ));
                }
                for (child, span) in np.cids.iter().zip(np.spans.iter()) {
                    verify_subtree(store, *child, *span).await?;
                }
                Ok(())
            }
            BlockType::Manifest => Err(DagError::Integrity(
                "unexpected manifest under root".into(),
            )),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DagBuilder;
    use crate::testutil::MapStore;
    use crate::BlockSink;
    use silt_proto::{Block, CODEC_CBOR};

    #[tokio::test]
    async fn test_verify_built_dag() {
        let store = MapStore::new();
        let data = vec![0x5A; 100];
        let (_, cid) = DagBuilder::with_params(store.clone(), 8, 3)
            .build_from_reader("f", "", &data[..])
            .await
            .unwrap();
        verify(store.as_ref(), &cid).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_empty_dag() {
        let store = MapStore::new();
        let (_, cid) = DagBuilder::with_params(store.clone(), 1024, 16)
            .build_from_reader("f", "", &b""[..])
            .await
            .unwrap();
        verify(store.as_ref(), &cid).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_rejects_non_manifest() {
        let store = MapStore::new();
        let leaf = Block::build(silt_proto::BlockType::Data, "raw", b"x".to_vec()).unwrap();
        store.put_block(&leaf).await.unwrap();
        assert!(matches!(
            verify(store.as_ref(), &leaf.cid).await,
            Err(DagError::NotManifest)
        ));
    }

    #[tokio::test]
    async fn test_verify_detects_span_lie() {
        // A manifest whose declared size disagrees with the leaf span.
        let store = MapStore::new();
        let leaf = Block::build(silt_proto::BlockType::Data, "raw", b"abcd".to_vec()).unwrap();
        store.put_block(&leaf).await.unwrap();
        let mp = silt_proto::ManifestPayload {
            v: 1,
            size: 99,
            chunk: 4,
            fanout: 2,
            root: leaf.cid,
            name: "f".to_string(),
            mime: String::new(),
        };
        let manifest = Block::build(
            silt_proto::BlockType::Manifest,
            CODEC_CBOR,
            mp.to_vec().unwrap(),
        )
        .unwrap();
        store.put_block(&manifest).await.unwrap();

        assert!(matches!(
            verify(store.as_ref(), &manifest.cid).await,
            Err(DagError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_missing_child_fails() {
        let store = MapStore::new();
        let leaf = Block::build(silt_proto::BlockType::Data, "raw", b"abcd".to_vec()).unwrap();
        // leaf is never stored
        let mp = silt_proto::ManifestPayload {
            v: 1,
            size: 4,
            chunk: 4,
            fanout: 2,
            root: leaf.cid,
            name: "f".to_string(),
            mime: String::new(),
        };
        let manifest = Block::build(
            silt_proto::BlockType::Manifest,
            CODEC_CBOR,
            mp.to_vec().unwrap(),
        )
        .unwrap();
        store.put_block(&manifest).await.unwrap();

        assert!(matches!(
            verify(store.as_ref(), &manifest.cid).await,
            Err(DagError::NotFound)
        ));
    }
}
