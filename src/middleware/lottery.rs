use std::sync::Arc;

use anyhow::Result;
use http::Request;
use rand::Rng;

use crate::middleware::{BoxFuture, ClientContext, HttpResponse, Middleware, RoundTripper};
use crate::runtime::Runtime;

/// Sends `lottery` percent of requests through the hash balancer.
pub fn build(runtime: Arc<Runtime>) -> Middleware {
    Arc::new(move |next: Arc<dyn RoundTripper>| {
        Arc::new(LotteryMiddleware {
            next,
            runtime: Arc::clone(&runtime),
        }) as Arc<dyn RoundTripper>
    })
}

struct LotteryMiddleware {
    next: Arc<dyn RoundTripper>,
    runtime: Arc<Runtime>,
}

impl RoundTripper for LotteryMiddleware {
    fn round_trip(&self, mut req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        let next = Arc::clone(&self.next);
        if let Some(ctx) = req.extensions_mut().get_mut::<ClientContext>() {
            let chance = self.runtime.lottery.get();
            let won = draw(&mut rand::thread_rng(), chance);
            crate::metrics::record_lottery(won);
            if !won {
                log::debug!("lottery lost for {}, keeping proxy pick", ctx.uri);
                ctx.hashing = false;
            }
        }
        Box::pin(async move { next.round_trip(req).await })
    }
}

/// Draws from 1..=100 and wins when the draw is within `chance`.
pub fn draw<R: Rng + ?Sized>(rng: &mut R, chance: u8) -> bool {
    rng.gen_range(1..=100u8) <= chance
}
