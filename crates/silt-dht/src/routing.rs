//! Kademlia routing table.
//!
//! 256 k-buckets indexed by the leading-zero count of `self XOR id`.
//! Each bucket is an insertion-ordered list capped at `k` entries with the
//! most-recently-seen contact at the tail; overflow evicts the head.

use parking_lot::Mutex;
use silt_core::{NodeId, ID_BITS};
use silt_proto::Contact;

/// A single k-bucket guarded by its own mutex.
#[derive(Default)]
struct Bucket {
    /// Most-recently seen at the end.
    list: Mutex<Vec<Contact>>,
}

impl Bucket {
    /// Moves an existing contact to the tail, appends when there is room,
    /// or evicts the least-recently-seen head.
    fn touch(&self, contact: Contact, k: usize) -> Option<Contact> {
        let mut list = self.list.lock();
        if let Some(pos) = list.iter().position(|c| c == &contact) {
            let existing = list.remove(pos);
            list.push(existing);
            return None;
        }
        if list.len() < k {
            list.push(contact);
            return None;
        }
        let evicted = list.remove(0);
        list.push(contact);
        Some(evicted)
    }

    fn contacts(&self) -> Vec<Contact> {
        self.list.lock().clone()
    }

    fn remove_by_id(&self, id: &NodeId) -> bool {
        let mut list = self.list.lock();
        if let Some(pos) = list.iter().position(|c| c.id == *id) {
            list.remove(pos);
            return true;
        }
        false
    }

    fn remove_by_addr(&self, addr: &str) -> usize {
        let mut list = self.list.lock();
        let before = list.len();
        list.retain(|c| c.addr != addr);
        before - list.len()
    }

    fn len(&self) -> usize {
        self.list.lock().len()
    }
}

/// The routing table for one node.
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Creates an empty table for the given local id and bucket size.
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| Bucket::default()).collect();
        Self {
            self_id,
            k,
            buckets,
        }
    }

    /// Returns the local node id.
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Computes the bucket index for an id: the leading-zero count of the
    /// XOR distance, clamped into range.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        let distance = self.self_id.xor_distance(id);
        let lz = NodeId::new(distance).leading_zeros() as usize;
        lz.min(ID_BITS - 1)
    }

    /// Inserts or refreshes a contact. Self and zero ids are ignored.
    pub fn update(&self, contact: Contact) {
        if contact.id == self.self_id || contact.id.is_zero() {
            return;
        }
        let idx = self.bucket_index(&contact.id);
        let _evicted = self.buckets[idx].touch(contact, self.k);
    }

    /// Returns up to `max` contacts sorted by XOR distance to `target`,
    /// expanding outward from the target's bucket by radius.
    pub fn closest(&self, target: &NodeId, max: usize) -> Vec<Contact> {
        let idx = self.bucket_index(target);
        let mut all: Vec<Contact> = Vec::new();
        let mut radius = 0usize;
        while all.len() < max && (radius <= idx || idx + radius < ID_BITS) {
            if radius <= idx {
                all.extend(self.buckets[idx - radius].contacts());
            }
            if radius != 0 && idx + radius < ID_BITS {
                all.extend(self.buckets[idx + radius].contacts());
            }
            radius += 1;
        }
        all.sort_by_key(|c| c.id.xor_distance(target));
        all.truncate(max);
        all
    }

    /// Removes a contact by id. Returns true if it was present.
    pub fn remove(&self, contact: &Contact) -> bool {
        let idx = self.bucket_index(&contact.id);
        self.buckets[idx].remove_by_id(&contact.id)
    }

    /// Removes every contact with the given address, across all buckets.
    /// Returns the number removed.
    pub fn remove_by_addr(&self, addr: &str) -> usize {
        self.buckets.iter().map(|b| b.remove_by_addr(addr)).sum()
    }

    /// Total number of contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Returns true if no contacts are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(seed: u8) -> Contact {
        Contact {
            id: NodeId::new([seed; 32]),
            addr: format!("127.0.0.1:{}", 30000 + seed as u16),
            relay: String::new(),
        }
    }

    fn random_contact() -> Contact {
        Contact {
            id: NodeId::random(),
            addr: "127.0.0.1:31000".to_string(),
            relay: String::new(),
        }
    }

    #[test]
    fn test_update_ignores_self() {
        let id = NodeId::random();
        let table = RoutingTable::new(id, 20);
        table.update(Contact {
            id,
            addr: "127.0.0.1:1".to_string(),
            relay: String::new(),
        });
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_ignores_zero_id() {
        let table = RoutingTable::new(NodeId::random(), 20);
        table.update(Contact::default());
        assert!(table.is_empty());
    }

    #[test]
    fn test_repeated_touch_keeps_length() {
        let table = RoutingTable::new(NodeId::random(), 20);
        let c = contact(7);
        for _ in 0..5 {
            table.update(c.clone());
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_bucket_lru_eviction() {
        // Self at zero so all 0x80-prefixed ids share bucket 0.
        let table = RoutingTable::new(NodeId::new([0x00; 32]), 2);
        let mk = |tail: u8| {
            let mut bytes = [0x80; 32];
            bytes[31] = tail;
            Contact {
                id: NodeId::new(bytes),
                addr: format!("127.0.0.1:{}", 40000 + tail as u16),
                relay: String::new(),
            }
        };
        table.update(mk(1));
        table.update(mk(2));
        // Touching 1 moves it to the tail, so 2 is now the LRU head.
        table.update(mk(1));
        table.update(mk(3));

        let target = NodeId::new([0x80; 32]);
        let remaining = table.closest(&target, 10);
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|c| c.id == mk(1).id));
        assert!(remaining.iter().any(|c| c.id == mk(3).id));
        assert!(!remaining.iter().any(|c| c.id == mk(2).id));
    }

    #[test]
    fn test_bucket_index_leading_zeros() {
        let table = RoutingTable::new(NodeId::new([0x00; 32]), 20);

        // High bit differs: zero leading zeros.
        let mut far = [0x00; 32];
        far[0] = 0x80;
        assert_eq!(table.bucket_index(&NodeId::new(far)), 0);

        // Only the lowest bit differs: 255 leading zeros.
        let mut near = [0x00; 32];
        near[31] = 0x01;
        assert_eq!(table.bucket_index(&NodeId::new(near)), 255);

        let mut mid = [0x00; 32];
        mid[1] = 0x80;
        assert_eq!(table.bucket_index(&NodeId::new(mid)), 8);
    }

    #[test]
    fn test_closest_sorted_by_distance() {
        let table = RoutingTable::new(NodeId::random(), 20);
        for _ in 0..60 {
            table.update(random_contact());
        }
        let target = NodeId::random();
        let closest = table.closest(&target, 10);
        assert!(closest.len() <= 10);
        for pair in closest.windows(2) {
            assert!(
                pair[0].id.xor_distance(&target) <= pair[1].id.xor_distance(&target),
                "contacts not sorted by distance"
            );
        }
    }

    #[test]
    fn test_remove_by_id_and_addr() {
        let table = RoutingTable::new(NodeId::random(), 20);
        let a = contact(1);
        let b = contact(2);
        table.update(a.clone());
        table.update(b.clone());

        assert!(table.remove(&a));
        assert!(!table.remove(&a));
        assert_eq!(table.len(), 1);

        assert_eq!(table.remove_by_addr(&b.addr), 1);
        assert!(table.is_empty());
    }
}
