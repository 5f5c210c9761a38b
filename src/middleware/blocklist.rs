use std::sync::Arc;

use anyhow::Result;
use http::Request;

use crate::blocklist::Blocklist;
use crate::middleware::{BoxFuture, ClientContext, HttpResponse, Middleware, Rejection, RoundTripper};
use crate::runtime::Runtime;

pub fn build(runtime: Arc<Runtime>, blocklist: Arc<Blocklist>) -> Middleware {
    Arc::new(move |next: Arc<dyn RoundTripper>| {
        Arc::new(BlocklistMiddleware {
            next,
            runtime: Arc::clone(&runtime),
            blocklist: Arc::clone(&blocklist),
        }) as Arc<dyn RoundTripper>
    })
}

struct BlocklistMiddleware {
    next: Arc<dyn RoundTripper>,
    runtime: Arc<Runtime>,
    blocklist: Arc<Blocklist>,
}

impl RoundTripper for BlocklistMiddleware {
    fn round_trip(&self, req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        let next = Arc::clone(&self.next);
        let blocked = self.runtime.blocklist.get()
            && req
                .extensions()
                .get::<ClientContext>()
                .is_some_and(|ctx| self.blocklist.contains(&ctx.source_ip));
        Box::pin(async move {
            if blocked {
                if let Some(ctx) = req.extensions().get::<ClientContext>() {
                    log::info!("blocked request from {}", ctx.source_ip);
                }
                crate::metrics::record_denied("blocklist");
                return Ok(Rejection::Blocked.into_response());
            }
            next.round_trip(req).await
        })
    }
}
