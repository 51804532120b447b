//! Background maintenance loops.
//!
//! Four loops keep the node healthy: expired-record GC, origin republish,
//! bucket refresh and contact revalidation. Each checks cancellation at
//! every tick boundary and logs per-pass counters.

use std::sync::Arc;
use std::time::Instant;

use silt_core::NodeId;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::node::Node;

impl Node {
    /// Spawns all maintenance loops. They stop when the token fires.
    pub fn start_maintenance(self: &Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(Arc::clone(self).gc_loop(cancel.clone()));
        tokio::spawn(Arc::clone(self).republish_loop(cancel.clone()));
        tokio::spawn(Arc::clone(self).refresh_loop(cancel.clone()));
        tokio::spawn(Arc::clone(self).revalidate_loop(cancel));
    }

    /// Drops expired key/value records.
    async fn gc_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(self.config.gc_interval);
        tick.tick().await;
        info!(interval = ?self.config.gc_interval, "kv gc loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("kv gc loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let deleted = {
                        let mut kv = self.kv.write();
                        let before = kv.len();
                        kv.retain(|_, rec| now < rec.expires);
                        before - kv.len()
                    };
                    if deleted > 0 {
                        debug!(expired = deleted, "kv gc pass");
                    }
                }
            }
        }
    }

    /// Re-stores origin records whose remaining TTL is at most one
    /// republish interval, refreshing them across the overlay.
    async fn republish_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(self.config.republish_interval);
        tick.tick().await;
        info!(interval = ?self.config.republish_interval, "republish loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("republish loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let due: Vec<(String, Vec<u8>)> = {
                        let kv = self.kv.read();
                        kv.iter()
                            .filter(|(_, rec)| {
                                rec.origin
                                    && rec.expires.saturating_duration_since(now)
                                        <= self.config.republish_interval
                            })
                            .map(|(k, rec)| (k.clone(), rec.value.clone()))
                            .collect()
                    };
                    let republished = due.len();
                    for (key, value) in due {
                        let _ = self.store(&key, value).await;
                    }
                    if republished > 0 {
                        debug!(republished, "republish pass");
                    }
                }
            }
        }
    }

    /// Runs an iterative lookup on a random target to populate sparse
    /// buckets.
    async fn refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(self.config.bucket_refresh);
        tick.tick().await;
        info!(interval = ?self.config.bucket_refresh, "bucket refresh loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("bucket refresh loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    let target = NodeId::random();
                    let nodes = self.iterative_find_node(target, self.config.k).await;
                    debug!(nodes = nodes.len(), "bucket refresh pass");
                }
            }
        }
    }

    /// Pings α contacts near a random target; failures count toward
    /// eviction.
    async fn revalidate_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(self.config.revalidate_interval);
        tick.tick().await;
        info!(interval = ?self.config.revalidate_interval, "revalidate loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("revalidate loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    let target = NodeId::random();
                    let sample = self.rt.closest(&target, self.config.alpha);
                    let mut failed = 0;
                    for contact in &sample {
                        if self.ping(contact).await.is_err() {
                            self.on_rpc_failure(contact);
                            failed += 1;
                        }
                    }
                    if !sample.is_empty() {
                        debug!(peers = sample.len(), failed, "revalidate pass");
                    }
                }
            }
        }
    }
}
