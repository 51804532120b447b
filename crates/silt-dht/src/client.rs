//! RPC client side: dialing, iterative lookups, replication.

use std::collections::HashSet;
use std::sync::Arc;

use silt_core::{hash_key, Cid, Distance, NodeId};
use silt_proto::{Block, Contact, RpcKind, RpcMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::node::Node;
use crate::DhtError;

impl Node {
    /// Performs a single RPC against a contact, via its relay when one is
    /// set, else over direct TCP. One request, one response, then close.
    pub async fn dial_rpc(
        &self,
        contact: &Contact,
        req: RpcMessage,
    ) -> Result<RpcMessage, DhtError> {
        if !contact.relay.is_empty() {
            return self
                .dial_rpc_via_relay(&contact.relay, &contact.id.to_hex(), req)
                .await;
        }
        self.dial_addr(&contact.addr, req).await
    }

    async fn dial_addr(&self, addr: &str, req: RpcMessage) -> Result<RpcMessage, DhtError> {
        let deadline = self.config.rpc_timeout;
        let call = async {
            let stream = TcpStream::connect(addr).await?;
            let (read_half, mut write_half) = stream.into_split();

            trace!(kind = ?req.kind, peer = addr, key = %req.key, "-> rpc");
            let mut line = serde_json::to_vec(&req)?;
            line.push(b'\n');
            write_half.write_all(&line).await?;

            let mut reader = BufReader::new(read_half);
            let mut response = String::new();
            let n = reader.read_line(&mut response).await?;
            if n == 0 {
                return Err(DhtError::Protocol("connection closed".into()));
            }
            let resp: RpcMessage = serde_json::from_str(response.trim_end())?;
            trace!(kind = ?resp.kind, peer = %resp.from.addr, found = resp.found, "<- rpc");
            Ok(resp)
        };
        timeout(deadline, call).await.map_err(|_| DhtError::Timeout)?
    }

    /// Pings a peer. On success the responder's contact enters the routing
    /// table and its failure score is cleared.
    pub async fn ping(&self, contact: &Contact) -> Result<(), DhtError> {
        let req = RpcMessage::new(RpcKind::Ping, self.contact());
        let resp = self.dial_rpc(contact, req).await?;
        self.rt.update(resp.from.clone());
        self.on_rpc_success(&resp.from);
        Ok(())
    }

    /// Seeds the routing table by pinging the given addresses. Unreachable
    /// peers are skipped.
    pub async fn bootstrap(&self, peers: &[String]) {
        for addr in peers {
            let target = Contact {
                addr: addr.clone(),
                ..Contact::default()
            };
            let req = RpcMessage::new(RpcKind::Ping, self.contact());
            match self.dial_rpc(&target, req).await {
                Ok(resp) => self.rt.update(resp.from),
                Err(e) => debug!(peer = %addr, error = %e, "bootstrap ping failed"),
            }
        }
    }

    /// Stores a key/value pair: inserts locally as the origin, then
    /// replicates to the first `replicas` of the K closest peers.
    pub async fn store(self: &Arc<Self>, key: &str, value: Vec<u8>) -> Result<(), DhtError> {
        self.kv_insert(key, value.clone(), true);

        let peers = self
            .iterative_find_node(hash_key(key), self.config.k)
            .await;
        let mut sent = 0;
        // Peers may report this node back; replicating to ourselves would
        // overwrite the origin record with a cached copy.
        for peer in peers
            .iter()
            .filter(|c| c.id != self.id)
            .take(self.config.replicas)
        {
            let req = RpcMessage::new(RpcKind::Store, self.contact())
                .with_key(key)
                .with_value(value.clone());
            match self.dial_rpc(peer, req).await {
                Ok(_) => {
                    self.on_rpc_success(peer);
                    sent += 1;
                }
                Err(_) => self.on_rpc_failure(peer),
            }
        }
        debug!(key, replicas = sent, "stored record");
        Ok(())
    }

    /// Looks a key up: a local unexpired hit wins, else iterative
    /// FIND_VALUE toward the key's hash. The first value found is cached
    /// locally as a non-origin record.
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<Vec<u8>, DhtError> {
        if let Some(value) = self.kv_get(key) {
            return Ok(value);
        }

        let target = hash_key(key);
        let mut visited: HashSet<String> = HashSet::new();
        let mut cands = self.rt.closest(&target, self.config.k);

        while !cands.is_empty() {
            let responses = self.find_value_round(key, &cands, &mut visited).await;
            if responses.is_empty() {
                break;
            }
            let mut found: Option<Vec<u8>> = None;
            for resp in responses {
                if resp.found && found.is_none() {
                    found = Some(resp.value);
                } else {
                    cands.extend(resp.nodes);
                }
            }
            if let Some(value) = found {
                self.kv_insert_cached(key, value.clone());
                return Ok(value);
            }
            cands = uniq_and_sort_by_dist(cands, &target, &visited);
            cands.truncate(self.config.k);
        }
        Err(DhtError::NotFound)
    }

    /// Like [`Node::get`] but keeps searching after the first hit and
    /// returns every value collected. Used by provider-record resolution
    /// so callers see all known providers.
    pub async fn get_closest(self: &Arc<Self>, key: &str) -> Result<Vec<Vec<u8>>, DhtError> {
        let mut founds: Vec<Vec<u8>> = Vec::new();
        if let Some(value) = self.kv_get(key) {
            founds.push(value);
        }

        let target = hash_key(key);
        let mut visited: HashSet<String> = HashSet::new();
        let mut cands = self.rt.closest(&target, self.config.alpha);

        while !cands.is_empty() {
            let responses = self.find_value_round(key, &cands, &mut visited).await;
            if responses.is_empty() {
                break;
            }
            let mut batch_found = false;
            for resp in responses {
                if resp.found {
                    if !batch_found {
                        self.kv_insert_cached(key, resp.value.clone());
                        batch_found = true;
                    }
                    founds.push(resp.value);
                } else {
                    cands.extend(resp.nodes);
                }
            }
            cands = uniq_and_sort_by_dist(cands, &target, &visited);
            cands.truncate(self.config.k);
        }

        if founds.is_empty() {
            return Err(DhtError::NotFound);
        }
        Ok(founds)
    }

    fn kv_insert_cached(&self, key: &str, value: Vec<u8>) {
        self.kv_insert(key, value, false);
    }

    /// Sends one α-wide FIND_VALUE round and returns the successful
    /// responses. Queried peers are marked visited; failures are counted.
    async fn find_value_round(
        self: &Arc<Self>,
        key: &str,
        cands: &[Contact],
        visited: &mut HashSet<String>,
    ) -> Vec<RpcMessage> {
        let batch: Vec<Contact> = cands
            .iter()
            .filter(|c| !visited.contains(&c.addr))
            .take(self.config.alpha)
            .cloned()
            .collect();
        for peer in &batch {
            visited.insert(peer.addr.clone());
        }

        let mut tasks: JoinSet<(Contact, Result<RpcMessage, DhtError>)> = JoinSet::new();
        for peer in batch {
            let node = Arc::clone(self);
            let req = RpcMessage::new(RpcKind::FindValue, node.contact()).with_key(key);
            tasks.spawn(async move {
                let result = node.dial_rpc(&peer, req).await;
                (peer, result)
            });
        }

        let mut responses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((peer, result)) = joined else { continue };
            match result {
                Ok(resp) => {
                    self.rt.update(resp.from.clone());
                    self.on_rpc_success(&resp.from);
                    responses.push(resp);
                }
                Err(_) => self.on_rpc_failure(&peer),
            }
        }
        responses
    }

    /// Iterative FIND_NODE toward a target. Runs α-wide rounds until a
    /// round no longer strictly improves the best distance or the
    /// shortlist reaches `want`, then returns the top `want`.
    pub async fn iterative_find_node(
        self: &Arc<Self>,
        target: NodeId,
        want: usize,
    ) -> Vec<Contact> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut shortlist = self.rt.closest(&target, self.config.k);
        shortlist = uniq_and_sort_by_dist(shortlist, &target, &visited);

        loop {
            let batch: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !visited.contains(&c.addr))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for peer in &batch {
                visited.insert(peer.addr.clone());
            }

            let old_best = best_dist(&shortlist, &target);

            let mut tasks: JoinSet<(Contact, Result<RpcMessage, DhtError>)> = JoinSet::new();
            for peer in batch {
                let node = Arc::clone(self);
                let req = RpcMessage::new(RpcKind::FindNode, node.contact())
                    .with_key(target.to_hex());
                tasks.spawn(async move {
                    let result = node.dial_rpc(&peer, req).await;
                    (peer, result)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let Ok((peer, result)) = joined else { continue };
                match result {
                    Ok(resp) => {
                        self.rt.update(resp.from.clone());
                        self.on_rpc_success(&resp.from);
                        shortlist.extend(resp.nodes);
                    }
                    Err(_) => self.on_rpc_failure(&peer),
                }
            }

            shortlist = uniq_and_sort_by_dist(shortlist, &target, &visited);
            let progress = best_dist(&shortlist, &target) < old_best;
            if !progress || shortlist.len() >= want {
                break;
            }
        }

        shortlist.truncate(want);
        shortlist
    }

    /// Pulls a block's bytes from a specific peer.
    pub async fn fetch_block_from(
        &self,
        contact: &Contact,
        cid: &Cid,
    ) -> Result<Vec<u8>, DhtError> {
        let req = RpcMessage::new(RpcKind::FetchBlock, self.contact()).with_key(cid.encode());
        let resp = self.dial_rpc(contact, req).await?;
        if !resp.found {
            return Err(DhtError::NotFound);
        }
        Ok(resp.value)
    }

    /// Pushes a block to a specific peer for replication.
    pub async fn put_block_to(&self, contact: &Contact, block: &Block) -> Result<(), DhtError> {
        let req = RpcMessage::new(RpcKind::PutBlock, self.contact())
            .with_key(block.cid.encode())
            .with_value(block.bytes.clone());
        let resp = self.dial_rpc(contact, req).await?;
        if !resp.found {
            return Err(DhtError::Protocol("block rejected".into()));
        }
        Ok(())
    }
}

/// Best (smallest) distance in a shortlist; the maximum distance when it
/// is empty so any contact is an improvement.
pub(crate) fn best_dist(contacts: &[Contact], target: &NodeId) -> Distance {
    contacts
        .iter()
        .map(|c| c.id.xor_distance(target))
        .min()
        .unwrap_or([0xFF; 32])
}

/// Dedupes contacts by `(id, addr)`, drops zero ids, sorts by distance to
/// the target, and skips the already-visited prefix so the next batch
/// starts at the first unvisited contact.
pub(crate) fn uniq_and_sort_by_dist(
    contacts: Vec<Contact>,
    target: &NodeId,
    visited: &HashSet<String>,
) -> Vec<Contact> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<Contact> = Vec::with_capacity(contacts.len());
    for contact in contacts {
        if contact.id.is_zero() {
            continue;
        }
        if seen.insert(contact.endpoint_key()) {
            out.push(contact);
        }
    }
    out.sort_by_key(|c| c.id.xor_distance(target));

    let skip = out
        .iter()
        .take_while(|c| visited.contains(&c.addr))
        .count();
    out.drain(..skip);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(seed: u8) -> Contact {
        Contact {
            id: silt_core::NodeId::new([seed; 32]),
            addr: format!("127.0.0.1:{}", 32000 + seed as u16),
            relay: String::new(),
        }
    }

    #[test]
    fn test_best_dist_empty_is_max() {
        let target = silt_core::NodeId::new([0x01; 32]);
        assert_eq!(best_dist(&[], &target), [0xFF; 32]);
        let c = contact(0x01);
        assert_eq!(best_dist(&[c], &target), [0x00; 32]);
    }

    #[test]
    fn test_uniq_drops_duplicates_and_zero_ids() {
        let target = silt_core::NodeId::new([0x00; 32]);
        let list = vec![contact(2), contact(2), Contact::default(), contact(1)];
        let out = uniq_and_sort_by_dist(list, &target, &HashSet::new());
        assert_eq!(out.len(), 2);
        // sorted: id [1;32] is closer to zero than [2;32]
        assert_eq!(out[0], contact(1));
    }

    #[test]
    fn test_uniq_skips_visited_prefix() {
        let target = silt_core::NodeId::new([0x00; 32]);
        let mut visited = HashSet::new();
        visited.insert(contact(1).addr);
        let out = uniq_and_sort_by_dist(vec![contact(1), contact(2)], &target, &visited);
        assert_eq!(out, vec![contact(2)]);
    }
}
