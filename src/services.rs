use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::access_log::AccessLogger;
use crate::blocklist::{self, Blocklist};
use crate::config::Bootstrap;
use crate::discovery::{self, Discovery};
use crate::middleware::balance::Clusters;
use crate::middleware::limiter::{self, Limiter};
use crate::middleware::sign::SignHandler;
use crate::middleware::{self, Middleware, RoundTripper};
use crate::runtime::{Patcher, Runtime, RuntimeDefaults};
use crate::signer::Signer;
use crate::title::TitleSeries;
use crate::upstream::{Balancer, Cluster};

/// Everything a request or a background task needs, built once at startup
/// and passed by reference.
pub struct Services {
    pub config: Arc<Bootstrap>,
    pub runtime: Arc<Runtime>,
    pub blocklist: Arc<Blocklist>,
    pub clusters: Clusters,
    pub titles: Arc<TitleSeries>,
    pub signer: Signer,
    pub patcher: Patcher,
    pub limiter: Arc<Limiter>,
    pub access_log: Arc<AccessLogger>,
    pub cancel: CancellationToken,
}

impl Services {
    pub fn new(cfg: Bootstrap, cancel: CancellationToken) -> Result<Arc<Self>> {
        cfg.validate()?;
        let runtime = Arc::new(Runtime::new(RuntimeDefaults::from_config(&cfg), cancel.clone()));
        let blocklist = Arc::new(Blocklist::new(cfg.blocklist.enabled, cfg.blocklist.ban_time));
        let clusters = Clusters {
            nodes: Arc::new(Balancer::new(Cluster::Nodes.as_str())),
            cloud: Arc::new(Balancer::new(Cluster::Cloud.as_str())),
        };
        let titles = Arc::new(TitleSeries::from_seeds(&cfg.title_series).context("load title series")?);
        let signer = Signer::new(&cfg.link.secret, cfg.link.expiration);
        let patcher = Patcher::new(Arc::clone(&runtime), Arc::clone(&blocklist));
        let limiter = Arc::new(Limiter::new(cfg.limiter.max_req, cfg.limiter.records_duration)?);
        let access_log = Arc::new(AccessLogger::new(Some(cfg.access_log.path.as_str()))?);

        Ok(Arc::new(Self {
            config: Arc::new(cfg),
            runtime,
            blocklist,
            clusters,
            titles,
            signer,
            patcher,
            limiter,
            access_log,
            cancel,
        }))
    }

    pub fn balancer(&self, cluster: Cluster) -> &Arc<Balancer> {
        self.clusters.get(cluster)
    }

    /// The ingress pipeline, outermost stage first.
    pub fn pipeline(&self) -> Arc<dyn RoundTripper> {
        let middlewares: Vec<Middleware> = vec![
            middleware::recovery::build(),
            middleware::precondition::build(),
            middleware::blocklist::build(Arc::clone(&self.runtime), Arc::clone(&self.blocklist)),
            middleware::limiter::build(Arc::clone(&self.runtime), Arc::clone(&self.limiter)),
            middleware::quality::build(Arc::clone(&self.runtime), Arc::clone(&self.titles)),
            middleware::lottery::build(Arc::clone(&self.runtime)),
            middleware::balance::build(Arc::clone(&self.runtime), self.clusters.clone()),
        ];
        middleware::chain(&middlewares, Arc::new(SignHandler::new(self.signer.clone())))
    }

    /// Ready once any cluster can route, or right away without discovery.
    pub fn ready(&self) -> bool {
        if self.config.consul.address.is_empty() {
            return true;
        }
        self.clusters.nodes.live_count() > 0 || self.clusters.cloud.live_count() > 0
    }

    /// Starts the housekeeping loops and, given a registry, its watchers.
    pub fn spawn_background(&self, discovery: Option<Arc<dyn Discovery>>) -> Vec<JoinHandle<()>> {
        let cfg = &self.config;
        let mut handles = Vec::new();
        if let Some(handle) = crate::clock::spawn_ticker(self.cancel.clone()) {
            handles.push(handle);
        }
        handles.push(blocklist::spawn_sweeper(
            Arc::clone(&self.blocklist),
            cfg.blocklist.sweep_interval,
            self.cancel.clone(),
        ));
        handles.push(limiter::spawn_pruner(
            Arc::clone(&self.limiter),
            cfg.limiter.prune_interval,
            self.cancel.clone(),
        ));

        let Some(discovery) = discovery else {
            log::info!("discovery disabled, upstream stays empty");
            return handles;
        };
        for (cluster, service) in [
            (Cluster::Nodes, &cfg.consul.service_nodes),
            (Cluster::Cloud, &cfg.consul.service_cloud),
        ] {
            if service.is_empty() {
                continue;
            }
            handles.push(tokio::spawn(discovery::watch_service(
                Arc::clone(&discovery),
                service.clone(),
                Arc::clone(self.balancer(cluster)),
                cfg.consul.entries_domain.clone(),
                cfg.consul.retry_interval,
                self.cancel.clone(),
            )));
        }
        if !cfg.consul.kv_prefix.is_empty() {
            handles.push(tokio::spawn(discovery::watch_runtime(
                discovery,
                cfg.consul.kv_prefix.clone(),
                self.patcher.clone(),
                cfg.consul.retry_interval,
                self.cancel.clone(),
            )));
        }
        handles
    }
}
