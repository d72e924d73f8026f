//! Known peers and recently seen items

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Address and health of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer's node id
    pub node_id: String,

    pub host: String,

    pub port: u16,

    /// Last successful exchange, unix seconds
    pub last_seen: u64,

    /// Sends that failed since the last success
    pub failure_count: u64,
}

impl PeerInfo {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            last_seen: 0,
            failure_count: 0,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reset the failure count after a delivered message
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_seen = now_secs();
    }

    /// Count a failed delivery
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }
}

/// `node_id -> (host, port)`; peers stay listed after failures
#[derive(Debug, Default, Clone)]
pub struct PeerTable {
    peers: HashMap<String, PeerInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a peer; returns whether it was new
    pub fn insert(&mut self, info: PeerInfo) -> bool {
        match self.peers.get_mut(&info.node_id) {
            Some(existing) => {
                existing.host = info.host;
                existing.port = info.port;
                false
            }
            None => {
                self.peers.insert(info.node_id.clone(), info);
                true
            }
        }
    }

    pub fn remove(&mut self, node_id: &str) -> Option<PeerInfo> {
        self.peers.remove(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&PeerInfo> {
        self.peers.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut PeerInfo> {
        self.peers.get_mut(node_id)
    }

    /// Node ids in sorted order
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Bounded set of recently seen hashes, oldest evicted first
#[derive(Debug)]
pub struct SeenCache {
    entries: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `key`; returns false if it was already present
    pub fn insert(&mut self, key: String) -> bool {
        if self.entries.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_updates_address() {
        let mut table = PeerTable::new();
        assert!(table.insert(PeerInfo::new("b", "127.0.0.1", 9000)));
        table.get_mut("b").unwrap().record_failure();
        assert!(!table.insert(PeerInfo::new("b", "127.0.0.1", 9001)));

        let peer = table.get("b").unwrap();
        assert_eq!(peer.port, 9001);
        assert_eq!(peer.failure_count, 1);
        assert_eq!(peer.address(), "127.0.0.1:9001");
    }

    #[test]
    fn test_success_resets_failures() {
        let mut peer = PeerInfo::new("a", "localhost", 1);
        peer.record_failure();
        peer.record_failure();
        peer.record_success();
        assert_eq!(peer.failure_count, 0);
        assert!(peer.last_seen > 0);
    }

    #[test]
    fn test_ids_sorted() {
        let mut table = PeerTable::new();
        for id in ["c", "a", "b"] {
            table.insert(PeerInfo::new(id, "h", 1));
        }
        assert_eq!(table.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_seen_cache_evicts_oldest() {
        let mut seen = SeenCache::new(2);
        assert!(seen.insert("x".into()));
        assert!(!seen.insert("x".into()));
        assert!(seen.insert("y".into()));
        assert!(seen.insert("z".into()));
        assert!(!seen.contains("x"));
        assert!(seen.contains("z"));
        assert_eq!(seen.len(), 2);
    }
}
