//! Service-registry long polling.
//!
//! One watcher per cluster keeps that cluster's balancer in line with the
//! healthy instances of its service; one more watcher turns KV entries into
//! runtime patches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::middleware::BoxFuture;
use crate::runtime::{Patch, PatchKind, Patcher};
use crate::upstream::Balancer;

const MAX_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub node_name: String,
    pub node_ip: String,
    pub service_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Option<Bytes>,
    pub mod_index: u64,
}

pub trait Discovery: Send + Sync {
    /// Instances of `name` and the index to block on next.
    fn health_service(
        &self,
        name: &str,
        passing_only: bool,
        wait_index: u64,
    ) -> BoxFuture<Result<(Vec<ServiceInstance>, u64)>>;

    /// Entries under `prefix` and the index to block on next.
    fn kv_list(&self, prefix: &str, wait_index: u64) -> BoxFuture<Result<(Vec<KvEntry>, u64)>>;
}

/// FQDN of a registry node: the node name with the entries domain appended.
pub fn server_name(node_name: &str, domain: &str) -> String {
    let domain = domain.trim_matches('.');
    if domain.is_empty() || node_name.ends_with(domain) {
        node_name.to_string()
    } else {
        format!("{node_name}.{domain}")
    }
}

pub async fn watch_service(
    discovery: Arc<dyn Discovery>,
    service: String,
    balancer: Arc<Balancer>,
    domain: String,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    let watch = format!("service:{service}");
    let mut index = 0u64;
    let mut failures = 0u32;
    log::info!("watching service {} for cluster {}", service, balancer.cluster());

    loop {
        let poll = discovery.health_service(&service, true, index);
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            res = poll => res,
        };

        match result {
            Err(err) => {
                failures = (failures + 1).min(MAX_FAILURES);
                crate::metrics::record_discovery_failure(&watch);
                if failures >= MAX_FAILURES {
                    log::error!("discovery of {service} keeps failing: {err}");
                } else {
                    log::warn!("discovery of {service} failed: {err}");
                }
            }
            Ok((instances, _)) if instances.is_empty() => {
                failures = (failures + 1).min(MAX_FAILURES);
                crate::metrics::record_discovery_failure(&watch);
                if failures >= MAX_FAILURES {
                    log::error!("discovery of {service} returned no healthy instances");
                } else {
                    log::warn!("discovery of {service} returned an empty list");
                }
            }
            Ok((instances, next)) => {
                failures = 0;
                let unchanged = next == index;
                index = if next < index { 0 } else { next };
                let servers: HashMap<String, String> = instances
                    .into_iter()
                    .map(|inst| (server_name(&inst.node_name, &domain), inst.node_ip))
                    .collect();
                let summary = balancer.update_upstream(&servers);
                log::debug!(
                    "{} upstream updated: {} added, {} enabled, {} disabled",
                    balancer.cluster(),
                    summary.added,
                    summary.enabled,
                    summary.disabled
                );
                if !unchanged {
                    continue;
                }
            }
        }

        if !sleep_or_cancel(retry_interval, &cancel).await {
            break;
        }
    }
    log::info!("service watcher {service} stopped");
}

pub async fn watch_runtime(
    discovery: Arc<dyn Discovery>,
    prefix: String,
    patcher: Patcher,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    let watch = format!("kv:{prefix}");
    let mut index = 0u64;
    let mut failures = 0u32;
    let mut applied: HashMap<String, u64> = HashMap::new();
    log::info!("watching runtime entries under {prefix}");

    loop {
        let poll = discovery.kv_list(&prefix, index);
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            res = poll => res,
        };

        match result {
            Ok((entries, next)) => {
                failures = 0;
                let unchanged = next == index;
                index = if next < index { 0 } else { next };
                for entry in entries {
                    let Some(kind) = PatchKind::from_key(&entry.key) else {
                        log::debug!("runtime key {} ignored", entry.key);
                        continue;
                    };
                    if applied.get(&entry.key) == Some(&entry.mod_index) {
                        continue;
                    }
                    applied.insert(entry.key.clone(), entry.mod_index);
                    let Some(value) = entry.value else { continue };
                    let _ = patcher.apply(&Patch::new(kind, value)).await;
                }
                if !unchanged {
                    continue;
                }
            }
            Err(err) => {
                failures = (failures + 1).min(MAX_FAILURES);
                crate::metrics::record_discovery_failure(&watch);
                if failures >= MAX_FAILURES {
                    log::error!("runtime watch on {prefix} keeps failing: {err}");
                } else {
                    log::warn!("runtime watch on {prefix} failed: {err}");
                }
            }
        }

        if !sleep_or_cancel(retry_interval, &cancel).await {
            break;
        }
    }
    log::info!("runtime watcher {prefix} stopped");
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
