//! Per-zone peer registry keyed by public key

use std::collections::HashMap;

use crate::protocol::Peer;

/// Public key -> peer record for one zone
#[derive(Debug, Clone, Default)]
pub struct ZoneRegistry {
    zone: String,
    peers: HashMap<String, Peer>,
}

impl ZoneRegistry {
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            peers: HashMap::new(),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn get(&self, public_key: &str) -> Option<&Peer> {
        self.peers.get(public_key)
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.peers.contains_key(public_key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Record a peer, stamping it with this registry's zone
    ///
    /// Returns the previous record for the same key, if any.
    pub fn insert(&mut self, mut peer: Peer) -> Option<Peer> {
        peer.zone = self.zone.clone();
        self.peers.insert(peer.public_key.clone(), peer)
    }

    /// Replace the endpoint of an existing peer; nothing else changes
    pub fn update_endpoint(&mut self, public_key: &str, endpoint_ip: &str) -> Option<&Peer> {
        let peer = self.peers.get_mut(public_key)?;
        peer.endpoint_ip = endpoint_ip.to_string();
        Some(peer)
    }

    /// Every record, ordered by public key
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_stamps_zone() {
        let mut registry = ZoneRegistry::new("blue");
        let mut peer = Peer::new("k1", "1.1.1.1:51820");
        peer.zone = "red".to_string();

        assert!(registry.insert(peer).is_none());
        assert_eq!(registry.get("k1").unwrap().zone, "blue");
    }

    #[test]
    fn test_update_endpoint_keeps_address() {
        let mut registry = ZoneRegistry::new("blue");
        registry.insert(Peer::new("k1", "1.1.1.1:51820").with_node_address("10.0.0.1"));

        let updated = registry.update_endpoint("k1", "2.2.2.2:51820").unwrap();
        assert_eq!(updated.endpoint_ip, "2.2.2.2:51820");
        assert_eq!(updated.node_address, "10.0.0.1");
        assert_eq!(registry.len(), 1);

        assert!(registry.update_endpoint("missing", "x").is_none());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut registry = ZoneRegistry::new("blue");
        registry.insert(Peer::new("b", ""));
        registry.insert(Peer::new("a", ""));

        let keys: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|p| p.public_key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
