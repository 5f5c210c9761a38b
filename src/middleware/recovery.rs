use std::backtrace::Backtrace;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use http::Request;

use crate::middleware::{BoxFuture, HttpResponse, Middleware, Rejection, RoundTripper};

pub fn build() -> Middleware {
    Arc::new(|next: Arc<dyn RoundTripper>| Arc::new(RecoveryMiddleware { next }) as Arc<dyn RoundTripper>)
}

struct RecoveryMiddleware {
    next: Arc<dyn RoundTripper>,
}

impl RoundTripper for RecoveryMiddleware {
    fn round_trip(&self, req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        let next = Arc::clone(&self.next);
        let uri = req.uri().to_string();
        Box::pin(async move {
            match AssertUnwindSafe(next.round_trip(req)).catch_unwind().await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(err)) => {
                    log::error!("request {uri} failed: {err:#}");
                    Ok(Rejection::Internal("internal error".to_string()).into_response())
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    crate::metrics::record_recovered();
                    log::error!("request {uri} panicked: {reason}");
                    let trace = Backtrace::force_capture();
                    let _ = writeln!(std::io::stderr(), "panic serving {uri}: {reason}\n{trace}");
                    Ok(Rejection::Internal("internal error".to_string()).into_response())
                }
            }
        })
    }
}
