//! Local control surface.
//!
//! Every write goes through the runtime [`Patcher`](crate::runtime::Patcher),
//! so an admin call and the equivalent KV entry behave the same.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use url::form_urlencoded;

use crate::middleware::{text_response, HttpResponse};
use crate::runtime::{DeployMode, Patch, PatchKind};
use crate::services::Services;
use crate::title::Quality;
use crate::upstream::Cluster;

/// Handles `/api/*`. None for paths outside the admin surface.
pub async fn handle(
    services: &Services,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> Option<HttpResponse> {
    let route = path.strip_prefix("/api/")?;
    let mut params = parse_params(query.unwrap_or(""));
    if *method == Method::POST {
        if let Ok(form) = std::str::from_utf8(body) {
            params.extend(parse_params(form.trim()));
        }
    }

    let read = *method == Method::GET;
    let write = *method == Method::POST;
    let resp = match route.trim_end_matches('/') {
        "upstream" if read => upstream(services, &params),
        "reset" if read => reset(services, &params),
        "runtime" if read => text_response(StatusCode::OK, &services.runtime.dump()),
        "blocklist" if read => text_response(
            StatusCode::OK,
            &format!(
                "enabled {}\nsize {}\n",
                u8::from(services.blocklist.enabled()),
                services.blocklist.size()
            ),
        ),
        "blocklist/add" if write => match param(&params, "ip") {
            Ok(ips) => patch(services, Patch::new(PatchKind::BlocklistIps, ips.to_string())).await,
            Err(resp) => resp,
        },
        "blocklist/remove" if write => match param(&params, "ip") {
            Ok(ips) => patch(services, Patch::new(PatchKind::BlocklistRemove, ips.to_string())).await,
            Err(resp) => resp,
        },
        "blocklist/switch" if write => match param(&params, "enabled") {
            Ok(flag) => patch(services, Patch::new(PatchKind::Blocklist, flag.to_string())).await,
            Err(resp) => resp,
        },
        "blocklist/reset" if write => patch(services, Patch::new(PatchKind::BlocklistIps, "_")).await,
        "logger/level" if write => match param(&params, "level") {
            Ok(level) => patch(services, Patch::new(PatchKind::AccessLevel, level.to_string())).await,
            Err(resp) => resp,
        },
        "quality" if write => deploy(services, &params, PatchKind::Quality, "level").await,
        "lottery" if write => deploy(services, &params, PatchKind::Lottery, "chance").await,
        "cluster" if write => deploy(services, &params, PatchKind::Cluster, "name").await,
        "limiter" if write => match param(&params, "enabled") {
            Ok(flag) => patch(services, Patch::new(PatchKind::Limiter, flag.to_string())).await,
            Err(resp) => resp,
        },
        "access/stdout" if write => match param(&params, "enabled") {
            Ok(flag) => patch(services, Patch::new(PatchKind::AccessStdout, flag.to_string())).await,
            Err(resp) => resp,
        },
        "titleserie" if write => title_serie(services, &params),
        "upstream" | "reset" | "runtime" | "blocklist" | "blocklist/add" | "blocklist/remove"
        | "blocklist/switch" | "blocklist/reset" | "logger/level" | "quality" | "lottery" | "cluster"
        | "limiter" | "access/stdout" | "titleserie" => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Some(resp)
}

/// Decodes an `application/x-www-form-urlencoded` query or body. Later
/// duplicates win.
pub fn parse_params(raw: &str) -> HashMap<String, String> {
    form_urlencoded::parse(raw.as_bytes()).into_owned().collect()
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, HttpResponse> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| text_response(StatusCode::BAD_REQUEST, &format!("missing parameter {key}")))
}

async fn patch(services: &Services, patch: Patch) -> HttpResponse {
    match services.patcher.apply(&patch).await {
        Ok(()) => text_response(StatusCode::OK, "ok\n"),
        Err(err) => text_response(StatusCode::BAD_REQUEST, &format!("{err}\n")),
    }
}

async fn deploy(services: &Services, params: &HashMap<String, String>, kind: PatchKind, key: &str) -> HttpResponse {
    let value = match param(params, key) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    let mode = match params.get("mode").map(String::as_str) {
        None | Some("") => DeployMode::default(),
        Some(raw) => match DeployMode::parse(raw) {
            Some(mode) => mode,
            None => return text_response(StatusCode::BAD_REQUEST, &format!("invalid mode {raw:?}")),
        },
    };
    patch(services, Patch::new(kind, value.to_string()).with_mode(mode)).await
}

fn cluster_param(services: &Services, params: &HashMap<String, String>) -> Result<Cluster, HttpResponse> {
    match params.get("cluster").map(String::as_str) {
        None | Some("") => Ok(services.runtime.cluster.current()),
        Some(raw) => Cluster::parse(raw)
            .ok_or_else(|| text_response(StatusCode::BAD_REQUEST, &format!("unknown cluster {raw:?}"))),
    }
}

fn upstream(services: &Services, params: &HashMap<String, String>) -> HttpResponse {
    let cluster = match cluster_param(services, params) {
        Ok(cluster) => cluster,
        Err(resp) => return resp,
    };
    let balancer = services.balancer(cluster);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<40} {:<16} {:<5} {:<25} {:>10} {}",
        "name", "ip", "down", "last_changed", "requests", "last_request"
    );
    for server in balancer.servers() {
        let stats = server.stats();
        let _ = writeln!(
            out,
            "{:<40} {:<16} {:<5} {:<25} {:>10} {}",
            server.name(),
            server.ip(),
            stats.down,
            format_time(stats.last_changed),
            stats.handled_requests,
            stats.last_request.map(format_time).unwrap_or_else(|| "-".to_string())
        );
    }
    let _ = writeln!(out, "{} servers, {} live", balancer.servers().len(), balancer.live_count());
    text_response(StatusCode::OK, &out)
}

fn reset(services: &Services, params: &HashMap<String, String>) -> HttpResponse {
    let cluster = match cluster_param(services, params) {
        Ok(cluster) => cluster,
        Err(resp) => return resp,
    };
    services.balancer(cluster).reset_stats();
    log::info!("{cluster} server stats reset");
    text_response(StatusCode::OK, "ok\n")
}

fn title_serie(services: &Services, params: &HashMap<String, String>) -> HttpResponse {
    let parsed = (|| {
        let title = param(params, "title")?;
        let serie = param(params, "serie")?;
        let quality = param(params, "quality")?;
        let hash = param(params, "hash")?;
        let bad = |what: &str| text_response(StatusCode::BAD_REQUEST, &format!("invalid {what}"));
        let title = title.parse::<u16>().map_err(|_| bad("title"))?;
        let serie = serie.parse::<u16>().map_err(|_| bad("serie"))?;
        let quality = Quality::parse(quality).ok_or_else(|| bad("quality"))?;
        Ok::<_, HttpResponse>((title, serie, quality, hash.to_string()))
    })();
    match parsed {
        Ok((title, serie, quality, hash)) => {
            services.titles.insert_hash(title, serie, quality, &hash);
            log::info!("title {title} serie {serie} {quality} hash set");
            text_response(StatusCode::OK, "ok\n")
        }
        Err(resp) => resp,
    }
}

fn format_time(at: SystemTime) -> String {
    DateTime::<Utc>::from(at).format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
