use std::sync::Arc;

use anyhow::Result;
use http::{HeaderMap, Request};

use crate::constants;
use crate::middleware::{BoxFuture, ClientContext, HttpResponse, Middleware, Rejection, RemoteAddr, RoundTripper};
use crate::title::TitleRequest;

/// Requires the trusted proxy headers and seeds the [`ClientContext`].
///
/// Responses leave the pipeline with the final context in their extensions.
pub fn build() -> Middleware {
    Arc::new(|next: Arc<dyn RoundTripper>| Arc::new(PreconditionMiddleware { next }) as Arc<dyn RoundTripper>)
}

struct PreconditionMiddleware {
    next: Arc<dyn RoundTripper>,
}

impl RoundTripper for PreconditionMiddleware {
    fn round_trip(&self, mut req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            let ctx = match client_context(&req) {
                Ok(ctx) => ctx,
                Err(rejection) => {
                    log::debug!("request rejected: {rejection}");
                    return Ok(rejection.into_response());
                }
            };
            req.extensions_mut().insert(ctx.clone());
            let mut resp = next.round_trip(req).await?;
            // stages that answer early leave the context as it came in
            if resp.extensions().get::<ClientContext>().is_none() {
                resp.extensions_mut().insert(ctx);
            }
            Ok(resp)
        })
    }
}

pub fn client_context(req: &Request<()>) -> Result<ClientContext, Rejection> {
    let headers = req.headers();
    let uri = required(headers, constants::CLIENT_URI_KEY, "client_uri")?;
    let raw_uid = required(headers, constants::CLIENT_ID_KEY, "client_id")?;
    let cache_server = required(headers, constants::CACHE_SERVER_KEY, "cache_server")?;

    if !uri.starts_with('/') {
        return Err(Rejection::BadRequest(format!("invalid client_uri {uri:?}")));
    }
    let uid = parse_uid(raw_uid).ok_or_else(|| Rejection::BadRequest("invalid client_id".to_string()))?;
    let title = TitleRequest::parse(uri);
    if title.is_none() {
        log::debug!("{uri} is not a chunk uri, skipping rewrites");
    }

    Ok(ClientContext {
        uri: uri.to_string(),
        uid: uid.to_string(),
        cache_server: cache_server.to_string(),
        source_ip: source_ip(req),
        title,
        hashing: true,
        route: None,
    })
}

/// Strips the optional `uid=` prefix of a client id.
pub fn parse_uid(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let uid = raw
        .strip_prefix("uid")
        .map(str::trim_start)
        .filter(|rest| rest.starts_with('='))
        .unwrap_or(raw);
    let uid = uid.strip_prefix('=').unwrap_or(uid).trim();
    if uid.is_empty() {
        None
    } else {
        Some(uid)
    }
}

/// First `X-Forwarded-For` hop, else the connection peer.
pub fn source_ip(req: &Request<()>) -> String {
    let forwarded = req
        .headers()
        .get(constants::FORWARDED_FOR_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match forwarded {
        Some(ip) => ip.to_string(),
        None => req
            .extensions()
            .get::<RemoteAddr>()
            .map(|addr| addr.0.ip().to_string())
            .unwrap_or_default(),
    }
}

fn required<'a>(headers: &'a HeaderMap, name: &str, key: &'static str) -> Result<&'a str, Rejection> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(Rejection::Precondition(key))
}
