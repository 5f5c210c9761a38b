use std::sync::Arc;

use anyhow::Result;
use http::Request;

use crate::constants::MAX_TRIES;
use crate::middleware::{BoxFuture, ClientContext, HttpResponse, Middleware, Route, RoundTripper};
use crate::runtime::Runtime;
use crate::upstream::{BalanceError, Balancer, Cluster};

/// Balancers by cluster, as the pipeline sees them.
#[derive(Clone)]
pub struct Clusters {
    pub nodes: Arc<Balancer>,
    pub cloud: Arc<Balancer>,
}

impl Clusters {
    pub fn get(&self, cluster: Cluster) -> &Arc<Balancer> {
        match cluster {
            Cluster::Nodes => &self.nodes,
            Cluster::Cloud => &self.cloud,
        }
    }
}

pub fn build(runtime: Arc<Runtime>, clusters: Clusters) -> Middleware {
    Arc::new(move |next: Arc<dyn RoundTripper>| {
        Arc::new(BalanceMiddleware {
            next,
            runtime: Arc::clone(&runtime),
            clusters: clusters.clone(),
        }) as Arc<dyn RoundTripper>
    })
}

struct BalanceMiddleware {
    next: Arc<dyn RoundTripper>,
    runtime: Arc<Runtime>,
    clusters: Clusters,
}

impl RoundTripper for BalanceMiddleware {
    fn round_trip(&self, mut req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        let next = Arc::clone(&self.next);
        if let Some(ctx) = req.extensions_mut().get_mut::<ClientContext>() {
            if ctx.hashing {
                let cluster = self.runtime.cluster.get();
                ctx.route = route(ctx, cluster, self.clusters.get(cluster));
            }
        }
        Box::pin(async move { next.round_trip(req).await })
    }
}

/// Picks a server for the context, or None to keep the proxy hint.
pub fn route(ctx: &ClientContext, cluster: Cluster, balancer: &Balancer) -> Option<Route> {
    let title = ctx.title.as_ref()?;
    let label = cluster.as_str();
    match balancer.pick(&title.filename(), &title.rendition_prefix(), MAX_TRIES) {
        Ok(pick) => {
            let result = if pick.attempt == 0 { "ok" } else { "retry_ok" };
            crate::metrics::record_balance(label, result);
            Some(Route {
                host: pick.server.name().to_string(),
                ip: pick.server.ip().to_string(),
                cluster: Some(cluster),
            })
        }
        Err(err) => {
            crate::metrics::record_balance(label, err.label());
            match &err {
                BalanceError::UnparsableChunk(_) => log::debug!("{label}: {err}, bypassing hashing"),
                BalanceError::ServerUnavailable(_) => {
                    log::warn!("{label}: {err} after {MAX_TRIES} tries, using {}", ctx.cache_server)
                }
                BalanceError::UpstreamUnavailable(_) => {
                    log::error!("{label}: {err}, using {}", ctx.cache_server)
                }
            }
            None
        }
    }
}
