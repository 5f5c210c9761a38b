use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use http::Request;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::middleware::{BoxFuture, ClientContext, HttpResponse, Middleware, Rejection, RoundTripper};
use crate::runtime::Runtime;

#[derive(Clone, Copy)]
struct Window {
    start: Instant,
    count: u32,
}

/// Per source address budget of `max` requests per fixed `window`.
///
/// A window opens on the first request from an address and closes `window`
/// later; the next request after that opens a fresh one.
pub struct Limiter {
    max: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl Limiter {
    pub fn new(max: u32, window: Duration) -> Result<Self> {
        if max == 0 {
            return Err(anyhow!("limiter max must be positive"));
        }
        if window.is_zero() {
            return Err(anyhow!("limiter window must be positive"));
        }
        Ok(Self {
            max,
            window,
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// Counts one request for `ip`. False when the budget is spent.
    pub fn check(&self, ip: &str) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let entry = windows.entry(ip.to_string()).or_insert(Window { start: now, count: 0 });
        if now.saturating_duration_since(entry.start) >= self.window {
            *entry = Window { start: now, count: 0 };
        }
        if entry.count >= self.max {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drops windows that have already closed.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.start) < self.window);
        windows.shrink_to_fit();
        before - windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn spawn_pruner(limiter: Arc<Limiter>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = limiter.prune();
                    if pruned > 0 {
                        log::debug!("limiter pruned {pruned} idle addresses");
                    }
                }
            }
        }
    })
}

pub fn build(runtime: Arc<Runtime>, limiter: Arc<Limiter>) -> Middleware {
    Arc::new(move |next: Arc<dyn RoundTripper>| {
        Arc::new(LimiterMiddleware {
            next,
            runtime: Arc::clone(&runtime),
            limiter: Arc::clone(&limiter),
        }) as Arc<dyn RoundTripper>
    })
}

struct LimiterMiddleware {
    next: Arc<dyn RoundTripper>,
    runtime: Arc<Runtime>,
    limiter: Arc<Limiter>,
}

impl LimiterMiddleware {
    fn allowed(&self, ctx: &ClientContext) -> bool {
        if !self.runtime.limiter.get() || is_loopback(&ctx.source_ip) {
            return true;
        }
        self.limiter.check(&ctx.source_ip)
    }
}

impl RoundTripper for LimiterMiddleware {
    fn round_trip(&self, req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        let next = Arc::clone(&self.next);
        let allowed = req
            .extensions()
            .get::<ClientContext>()
            .map_or(true, |ctx| self.allowed(ctx));
        Box::pin(async move {
            if !allowed {
                if let Some(ctx) = req.extensions().get::<ClientContext>() {
                    log::info!("rate limited {}", ctx.source_ip);
                }
                crate::metrics::record_denied("limiter");
                return Ok(Rejection::RateLimited.into_response());
            }
            next.round_trip(req).await
        })
    }
}

fn is_loopback(ip: &str) -> bool {
    ip.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}
