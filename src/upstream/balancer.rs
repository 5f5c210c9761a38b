use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

use crate::upstream::{chunk_key, Registry, Server};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("chunk {0:?} is not routable")]
    UnparsableChunk(String),
    #[error("server {0} is down")]
    ServerUnavailable(String),
    #[error("cluster {0} has no live servers")]
    UpstreamUnavailable(String),
}

impl BalanceError {
    pub fn label(&self) -> &'static str {
        match self {
            BalanceError::UnparsableChunk(_) => "unparsable_chunk",
            BalanceError::ServerUnavailable(_) => "server_unavailable",
            BalanceError::UpstreamUnavailable(_) => "upstream_unavailable",
        }
    }
}

/// A routed server and the rank it was found at (0 is the HRW winner).
#[derive(Debug, Clone)]
pub struct Pick {
    pub server: Arc<Server>,
    pub attempt: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    pub added: usize,
    pub enabled: usize,
    pub disabled: usize,
}

/// Rendezvous (highest random weight) balancer over one cluster.
///
/// The ring lock is always taken before the registry lock, so a reader
/// holding the ring sees the registry of exactly one upstream update.
pub struct Balancer {
    cluster: String,
    registry: Registry,
    ring: RwLock<Vec<String>>,
}

impl Balancer {
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            registry: Registry::new(),
            ring: RwLock::new(Vec::new()),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Routes a segment to the top-ranked server without retrying.
    pub fn balance(&self, chunk_name: &str, prefix: &str) -> Result<Arc<Server>, BalanceError> {
        let key = chunk_key(chunk_name).ok_or_else(|| BalanceError::UnparsableChunk(chunk_name.to_string()))?;
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        let ip = top_ranked(&ring, prefix, &key)
            .ok_or_else(|| BalanceError::UpstreamUnavailable(self.cluster.clone()))?;
        let server = self
            .registry
            .get(ip)
            .ok_or_else(|| BalanceError::UpstreamUnavailable(self.cluster.clone()))?;
        if server.is_down() {
            return Err(BalanceError::ServerUnavailable(ip.to_string()));
        }
        server.record_request(crate::clock::now());
        Ok(server)
    }

    /// The `n` best servers for a chunk key in rank order, live or not.
    pub fn get_top_n(&self, key: &str, prefix: &str, n: usize) -> Vec<Arc<Server>> {
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        ranked(&ring, prefix, key)
            .into_iter()
            .take(n)
            .filter_map(|ip| self.registry.get(ip))
            .collect()
    }

    /// Routes a segment, walking down the ranking past servers marked down.
    pub fn pick(&self, chunk_name: &str, prefix: &str, tries: usize) -> Result<Pick, BalanceError> {
        let key = chunk_key(chunk_name).ok_or_else(|| BalanceError::UnparsableChunk(chunk_name.to_string()))?;
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        if ring.is_empty() {
            return Err(BalanceError::UpstreamUnavailable(self.cluster.clone()));
        }
        let ranking = ranked(&ring, prefix, &key);
        for (attempt, ip) in ranking.iter().take(tries.max(1)).enumerate() {
            let Some(server) = self.registry.get(ip) else { continue };
            if server.is_down() {
                log::debug!("{} server {} is down, trying next rank", self.cluster, ip);
                continue;
            }
            server.record_request(crate::clock::now());
            return Ok(Pick { server, attempt });
        }
        if self.registry.live_count() == 0 {
            return Err(BalanceError::UpstreamUnavailable(self.cluster.clone()));
        }
        Err(BalanceError::ServerUnavailable(ranking[0].to_string()))
    }

    /// Applies a discovery snapshot of `name -> ip`.
    ///
    /// New addresses join the ring; known ones take the snapshot's name and
    /// are re-enabled. Servers whose name left the snapshot are marked down but stay in the ring so keys
    /// keep their owner when the server comes back.
    pub fn update_upstream(&self, servers_by_name: &HashMap<String, String>) -> UpdateSummary {
        let mut summary = UpdateSummary::default();
        let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());

        for (name, ip) in servers_by_name {
            match self.registry.get(ip) {
                Some(server) => {
                    let server = if server.name() == name {
                        server
                    } else {
                        log::info!("{} server {} renamed to {}", self.cluster, server.name(), name);
                        let renamed = Arc::new(server.renamed(name));
                        self.registry.put(ip, Arc::clone(&renamed));
                        renamed
                    };
                    if server.set_down(false) {
                        log::info!("{} server {} ({}) is back up", self.cluster, name, ip);
                        summary.enabled += 1;
                    }
                }
                None => {
                    self.registry.put(ip, Arc::new(Server::new(name, ip)));
                    if let Err(pos) = ring.binary_search(ip) {
                        ring.insert(pos, ip.clone());
                    }
                    log::info!("{} server {} ({}) added", self.cluster, name, ip);
                    summary.added += 1;
                }
            }
        }

        for server in self.registry.snapshot().values() {
            // a name that moved to another address leaves its old entry down
            if servers_by_name.get(server.name()).map(String::as_str) == Some(server.ip()) {
                continue;
            }
            if server.set_down(true) {
                log::warn!("{} server {} ({}) went down", self.cluster, server.name(), server.ip());
                summary.disabled += 1;
            }
        }

        crate::metrics::set_servers(&self.cluster, self.registry.live_count(), self.registry.len());
        summary
    }

    /// Forgets every server of the cluster.
    pub fn reset_upstream(&self) {
        let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
        ring.clear();
        self.registry.clear();
        crate::metrics::set_servers(&self.cluster, 0, 0);
    }

    pub fn reset_stats(&self) {
        self.registry.reset_stats();
    }

    /// Servers ordered by address.
    pub fn servers(&self) -> Vec<Arc<Server>> {
        let snapshot = self.registry.snapshot();
        let (ips, _) = self.registry.ips();
        ips.iter().filter_map(|ip| snapshot.get(ip).cloned()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.registry.live_count()
    }
}

fn rank(ip: &str, prefix: &str, key: &str) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(ip.as_bytes());
    hasher.update(prefix.as_bytes());
    hasher.update(key.as_bytes());
    hasher.digest()
}

fn top_ranked<'a>(ring: &'a [String], prefix: &str, key: &str) -> Option<&'a str> {
    ring.iter()
        .map(|ip| (rank(ip, prefix, key), ip.as_str()))
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)))
        .map(|(_, ip)| ip)
}

fn ranked<'a>(ring: &'a [String], prefix: &str, key: &str) -> Vec<&'a str> {
    let mut scored: Vec<(u64, &str)> = ring
        .iter()
        .map(|ip| (rank(ip, prefix, key), ip.as_str()))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().map(|(_, ip)| ip).collect()
}
