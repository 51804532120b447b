//! Silt Service - the composition layer.
//!
//! Wires the DHT node, a blockstore and the DAG builder into the typed
//! operations the daemon exposes, and runs the reprovider and blockstore
//! GC loops.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod dist;
pub mod fetcher;
pub mod provider;
pub mod service;

use silt_dag::DagError;
use silt_dht::DhtError;
use silt_store::StoreError;
use thiserror::Error;

pub use dist::{keep_local_selector, DistStore};
pub use fetcher::ProviderFetcher;
pub use provider::NodeBlockProvider;
pub use service::{PinInfo, Service};

/// Fraction of non-manifest blocks kept locally on a distributed add.
pub const DEFAULT_KEEP_LOCAL_FRACTION: f64 = 0.2;

/// Interval of the provider-record refresh loop (6 hours).
pub const DEFAULT_REPROVIDE_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(6 * 60 * 60);

/// Interval of the background blockstore GC (1 hour).
pub const DEFAULT_BLOCKSTORE_GC_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(60 * 60);

/// Errors surfaced by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// DAG build, verify or fetch failure.
    #[error(transparent)]
    Dag(#[from] DagError),

    /// Blockstore failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Overlay failure.
    #[error(transparent)]
    Dht(#[from] DhtError),

    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The addressed block is not a manifest.
    #[error("not a manifest")]
    NotManifest,

    /// A CID operand could not be parsed.
    #[error(transparent)]
    Cid(#[from] silt_core::CidError),
}
