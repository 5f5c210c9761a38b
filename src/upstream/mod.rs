use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

pub mod balancer;
pub mod chunk;

pub use balancer::{BalanceError, Balancer, Pick, UpdateSummary};
pub use chunk::chunk_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cluster {
    Nodes,
    Cloud,
}

impl Cluster {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nodes" => Some(Cluster::Nodes),
            "cloud" => Some(Cluster::Cloud),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cluster::Nodes => "nodes",
            Cluster::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub down: bool,
    pub last_changed: SystemTime,
    pub handled_requests: u64,
    pub last_request: Option<SystemTime>,
}

/// One cache server of a cluster. Identity is fixed; liveness and counters
/// sit behind the server's own lock.
#[derive(Debug)]
pub struct Server {
    name: String,
    ip: String,
    stats: RwLock<ServerStats>,
}

impl Server {
    pub fn new(name: &str, ip: &str) -> Self {
        Self {
            name: name.to_string(),
            ip: ip.to_string(),
            stats: RwLock::new(ServerStats {
                down: false,
                last_changed: crate::clock::now(),
                handled_requests: 0,
                last_request: None,
            }),
        }
    }

    /// Same address under a new name, keeping liveness and counters.
    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ip: self.ip.clone(),
            stats: RwLock::new(self.stats()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn is_down(&self) -> bool {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).down
    }

    /// Flips liveness. Returns true when the flag actually changed.
    pub fn set_down(&self, down: bool) -> bool {
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        if stats.down == down {
            return false;
        }
        stats.down = down;
        stats.last_changed = crate::clock::now().max(stats.last_changed);
        true
    }

    pub fn record_request(&self, at: SystemTime) {
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        stats.handled_requests += 1;
        stats.last_request = Some(match stats.last_request {
            Some(prev) => prev.max(at),
            None => at,
        });
    }

    pub fn reset_stats(&self) {
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        stats.handled_requests = 0;
        stats.last_request = None;
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// `ip -> Server` for one cluster.
#[derive(Debug, Default)]
pub struct Registry {
    servers: RwLock<HashMap<String, Arc<Server>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, ip: &str, server: Arc<Server>) {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.insert(ip.to_string(), server);
    }

    pub fn get(&self, ip: &str) -> Option<Arc<Server>> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.get(ip).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, Arc<Server>> {
        self.servers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Addresses in lexicographic order, with their count.
    pub fn ips(&self) -> (Vec<String>, usize) {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let mut ips: Vec<String> = servers.keys().cloned().collect();
        ips.sort();
        let count = ips.len();
        (ips, count)
    }

    pub fn reset_stats(&self) {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        for server in servers.values() {
            server.reset_stats();
        }
    }

    pub fn clear(&self) {
        self.servers.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_count(&self) -> usize {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.values().filter(|s| !s.is_down()).count()
    }
}
