use std::sync::Arc;

use anyhow::Result;
use http::Request;

use crate::middleware::{BoxFuture, ClientContext, HttpResponse, Middleware, RoundTripper};
use crate::runtime::Runtime;
use crate::title::{Extension, Quality, TitleRequest, TitleSeries};

/// Serves renditions above the allowed quality from the allowed one.
pub fn build(runtime: Arc<Runtime>, titles: Arc<TitleSeries>) -> Middleware {
    Arc::new(move |next: Arc<dyn RoundTripper>| {
        Arc::new(QualityMiddleware {
            next,
            runtime: Arc::clone(&runtime),
            titles: Arc::clone(&titles),
        }) as Arc<dyn RoundTripper>
    })
}

struct QualityMiddleware {
    next: Arc<dyn RoundTripper>,
    runtime: Arc<Runtime>,
    titles: Arc<TitleSeries>,
}

impl RoundTripper for QualityMiddleware {
    fn round_trip(&self, mut req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        let next = Arc::clone(&self.next);
        if let Some(ctx) = req.extensions_mut().get_mut::<ClientContext>() {
            let limit = self.runtime.quality.get();
            downgrade(ctx, limit, &self.titles);
        }
        Box::pin(async move { next.round_trip(req).await })
    }
}

/// Rewrites the context to `limit` when the request asks for more.
/// Segments need the target rendition's hash; without it nothing changes.
pub fn downgrade(ctx: &mut ClientContext, limit: Quality, titles: &TitleSeries) -> bool {
    let Some(title) = ctx.title.as_ref() else {
        return false;
    };
    if title.quality <= limit {
        return false;
    }

    let mut rewritten = TitleRequest {
        quality: limit,
        ..title.clone()
    };
    if rewritten.extension == Extension::Ts {
        match titles.hash_for(title.title_id, title.episode_id, limit) {
            Some(hash) => rewritten.hash = hash,
            None => {
                log::debug!(
                    "no {} hash for title {} episode {}, keeping {}",
                    limit,
                    title.title_id,
                    title.episode_id,
                    ctx.uri
                );
                return false;
            }
        }
    }

    log::debug!("quality {} -> {} for {}", title.quality, limit, ctx.uri);
    ctx.uri = rewritten.path();
    ctx.title = Some(rewritten);
    true
}
