use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use pprof::protos::Message;
use tokio::net::TcpListener;

use crate::access_log::AccessRecord;
use crate::constants;
use crate::metrics;
use crate::middleware::{empty_response, json_response, text_response, ClientContext, HttpResponse, RemoteAddr, Route, RoundTripper};
use crate::runtime;
use crate::services::Services;

const DEFAULT_LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "127.1"];
const MAX_ADMIN_BODY: usize = 64 * 1024;

struct AppState {
    services: Arc<Services>,
    pipeline: Arc<dyn RoundTripper>,
    local_hosts: HashSet<String>,
}

pub async fn run(services: Arc<Services>) -> Result<()> {
    let addr = services.config.server.addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("listening on {}", listener.local_addr().context("listener address")?);
    serve(listener, services).await
}

/// Accepts connections until the services' cancel token fires.
pub async fn serve(listener: TcpListener, services: Arc<Services>) -> Result<()> {
    let state = Arc::new(AppState {
        pipeline: services.pipeline(),
        local_hosts: build_local_hosts(&services.config.server.local_api_allow_hosts),
        services,
    });
    let cancel = state.services.cancel.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(val) => val,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |mut req: Request<Incoming>| {
                        req.extensions_mut().insert(RemoteAddr(peer));
                        handle(req, Arc::clone(&state))
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("connection from {peer} closed: {err}");
                    }
                });
            }
        }
    }
    log::info!("server stopped accepting connections");
    Ok(())
}

fn build_local_hosts(extra: &[String]) -> HashSet<String> {
    DEFAULT_LOCAL_HOSTS
        .iter()
        .map(|h| h.to_string())
        .chain(extra.iter().cloned())
        .collect()
}

async fn handle(req: Request<Incoming>, state: Arc<AppState>) -> Result<HttpResponse, hyper::Error> {
    let request_id = metrics::request_id_from_headers(req.headers());
    let is_local = extract_host(&req)
        .map(|h| strip_port(&h).to_string())
        .is_some_and(|h| state.local_hosts.contains(&h));

    let trace_id = request_id.clone();
    let mut resp = crate::logging::with_trace_id(trace_id, async {
        if is_local {
            handle_internal(req, &state).await
        } else {
            handle_pipeline(req, &state).await
        }
    })
    .await;

    metrics::record(resp.status());
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    let cors = &state.services.config.server.cors;
    if !cors.is_empty() {
        if let Ok(val) = HeaderValue::from_str(cors) {
            resp.headers_mut().insert("Access-Control-Allow-Origin", val);
        }
    }
    Ok(resp)
}

async fn handle_pipeline(req: Request<Incoming>, state: &AppState) -> HttpResponse {
    let start_at = Instant::now();
    let (parts, _body) = req.into_parts();
    let req = Request::from_parts(parts, ());
    let request_id = metrics::request_id_from_headers(req.headers());
    let source_ip = crate::middleware::precondition::source_ip(&req);

    let resp = match state.pipeline.round_trip(req).await {
        Ok(resp) => resp,
        Err(err) => {
            log::error!("pipeline failed: {err:#}");
            crate::middleware::Rejection::Internal("internal error".to_string()).into_response()
        }
    };
    log_access(state, source_ip, &resp, start_at, request_id);
    resp
}

/// Logs from the context the pipeline finished with. Requests rejected
/// before a context existed only carry their source address.
fn log_access(state: &AppState, source_ip: String, resp: &HttpResponse, start_at: Instant, request_id: String) {
    let ctx = resp.extensions().get::<ClientContext>();
    let route = resp.extensions().get::<Route>();
    let record = AccessRecord {
        client_ip: ctx.map(|c| c.source_ip.clone()).unwrap_or(source_ip),
        status: resp.status().as_u16(),
        uri: ctx.map(|c| c.uri.clone()).unwrap_or_default(),
        location_host: route.map(|r| r.host.clone()).unwrap_or_default(),
        cluster: route
            .and_then(|r| r.cluster)
            .map(|c| c.as_str().to_string())
            .unwrap_or_default(),
        duration: start_at.elapsed(),
        request_id,
    };
    let stdout = state.services.runtime.access_stdout.get();
    state.services.access_log.log(&record, stdout);
}

async fn handle_internal(req: Request<Incoming>, state: &AppState) -> HttpResponse {
    let path = req.uri().path().to_string();
    let services = &state.services;
    if path.starts_with("/debug/pprof") {
        if !services.config.server.pprof {
            return text_response(StatusCode::NOT_FOUND, "not found");
        }
        return handle_pprof(req.uri().query()).await;
    }
    if path.starts_with("/api/") {
        let method = req.method().clone();
        let query = req.uri().query().map(str::to_string);
        let body = if method == Method::POST {
            match read_body(req.into_body()).await {
                Ok(body) => body,
                Err(err) => return text_response(StatusCode::BAD_REQUEST, &format!("{err:#}")),
            }
        } else {
            Bytes::new()
        };
        if let Some(resp) = crate::admin::handle(services, &method, &path, query.as_deref(), &body).await {
            return resp;
        }
    }
    match path.as_str() {
        "/healthz/liveness-probe" => empty_response(StatusCode::OK),
        "/healthz/readiness-probe" => {
            if services.ready() {
                empty_response(StatusCode::OK)
            } else {
                empty_response(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
        "/version" => json_response(&runtime::build_info()),
        "/metrics" => text_response(StatusCode::OK, &metrics::render()),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn read_body(body: Incoming) -> Result<Bytes> {
    let body = body.collect().await.context("read request body")?.to_bytes();
    if body.len() > MAX_ADMIN_BODY {
        anyhow::bail!("request body larger than {MAX_ADMIN_BODY} bytes");
    }
    Ok(body)
}

fn extract_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.headers().get("host") {
        return host.to_str().ok().map(|v| v.to_string());
    }
    req.uri().host().map(|v| v.to_string())
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split(']').next().map(|h| h.trim_start_matches('[')).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

async fn handle_pprof(query: Option<&str>) -> HttpResponse {
    let mut seconds = 30u64;
    if let Some(query) = query {
        for part in query.split('&') {
            if let Some(("seconds", val)) = part.split_once('=') {
                if let Ok(parsed) = val.parse::<u64>() {
                    seconds = parsed;
                }
            }
        }
    }
    seconds = seconds.clamp(1, 120);
    let guard = match pprof::ProfilerGuard::new(100) {
        Ok(guard) => guard,
        Err(err) => {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("pprof guard error: {err}"));
        }
    };
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let report = match guard.report().build() {
        Ok(report) => report,
        Err(err) => {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("pprof report error: {err}"));
        }
    };
    let profile = match report.pprof() {
        Ok(profile) => profile,
        Err(err) => {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("pprof encode error: {err}"));
        }
    };
    let mut body = Vec::new();
    if let Err(err) = profile.write_to_vec(&mut body) {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("pprof encode error: {err}"));
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .header("Content-Length", body.len().to_string())
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
