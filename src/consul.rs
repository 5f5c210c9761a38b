use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;

use crate::config;
use crate::discovery::{Discovery, KvEntry, ServiceInstance};
use crate::middleware::BoxFuture;

const INDEX_HEADER: &str = "X-Consul-Index";

/// Consul agent HTTP API client for health and KV blocking queries.
#[derive(Clone)]
pub struct ConsulClient {
    client: Client<HttpConnector, Full<Bytes>>,
    address: String,
    wait: Duration,
}

impl ConsulClient {
    pub fn new(cfg: &config::Consul) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(Duration::from_secs(5)));
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(4)
            .build(connector);
        let address = if cfg.address.contains("://") {
            cfg.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", cfg.address.trim_end_matches('/'))
        };
        Self {
            client,
            address,
            wait: cfg.wait,
        }
    }

    async fn get(&self, path_and_query: &str) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let uri: Uri = format!("{}{}", self.address, path_and_query)
            .parse()
            .context("build consul uri")?;
        let req = http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .context("build consul request")?;
        // the agent holds blocking queries for up to `wait` plus jitter
        let deadline = self.wait + self.wait / 16 + Duration::from_secs(5);
        let resp = tokio::time::timeout(deadline, self.client.request(req))
            .await
            .map_err(|_| anyhow!("consul request timed out"))?
            .context("consul request")?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = collect_body(resp).await?;
        Ok((status, headers, body))
    }

    pub async fn health_service(
        &self,
        name: &str,
        passing_only: bool,
        wait_index: u64,
    ) -> Result<(Vec<ServiceInstance>, u64)> {
        let mut path = format!(
            "/v1/health/service/{}?index={}&wait={}s",
            name,
            wait_index,
            self.wait.as_secs().max(1)
        );
        if passing_only {
            path.push_str("&passing=true");
        }
        let (status, headers, body) = self.get(&path).await?;
        if status != StatusCode::OK {
            return Err(anyhow!("consul health {} returned {}", name, status));
        }
        let index = parse_index(&headers)?;
        Ok((parse_health(&body)?, index))
    }

    pub async fn kv_list(&self, prefix: &str, wait_index: u64) -> Result<(Vec<KvEntry>, u64)> {
        let path = format!(
            "/v1/kv/{}?recurse=true&index={}&wait={}s",
            prefix.trim_start_matches('/'),
            wait_index,
            self.wait.as_secs().max(1)
        );
        let (status, headers, body) = self.get(&path).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), parse_index(&headers).unwrap_or(wait_index)));
        }
        if status != StatusCode::OK {
            return Err(anyhow!("consul kv {} returned {}", prefix, status));
        }
        let index = parse_index(&headers)?;
        Ok((parse_kv(&body)?, index))
    }
}

impl Discovery for ConsulClient {
    fn health_service(
        &self,
        name: &str,
        passing_only: bool,
        wait_index: u64,
    ) -> BoxFuture<Result<(Vec<ServiceInstance>, u64)>> {
        let this = self.clone();
        let name = name.to_string();
        Box::pin(async move { this.health_service(&name, passing_only, wait_index).await })
    }

    fn kv_list(&self, prefix: &str, wait_index: u64) -> BoxFuture<Result<(Vec<KvEntry>, u64)>> {
        let this = self.clone();
        let prefix = prefix.to_string();
        Box::pin(async move { this.kv_list(&prefix, wait_index).await })
    }
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Node")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RawKvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

pub fn parse_health(body: &[u8]) -> Result<Vec<ServiceInstance>> {
    let entries: Vec<HealthEntry> = serde_json::from_slice(body).context("decode consul health")?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let node_ip = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            ServiceInstance {
                node_name: entry.node.name,
                node_ip,
                service_port: entry.service.port,
            }
        })
        .collect())
}

pub fn parse_kv(body: &[u8]) -> Result<Vec<KvEntry>> {
    let entries: Vec<RawKvEntry> = serde_json::from_slice(body).context("decode consul kv")?;
    entries
        .into_iter()
        .map(|entry| {
            let value = match entry.value {
                Some(raw) => Some(Bytes::from(
                    STANDARD
                        .decode(raw.as_bytes())
                        .with_context(|| format!("decode value of {}", entry.key))?,
                )),
                None => None,
            };
            Ok(KvEntry {
                key: entry.key,
                value,
                mod_index: entry.modify_index,
            })
        })
        .collect()
}

fn parse_index(headers: &HeaderMap) -> Result<u64> {
    headers
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("consul response without {INDEX_HEADER}"))
}

async fn collect_body(resp: http::Response<Incoming>) -> Result<Bytes> {
    let body = resp.into_body().collect().await.context("read consul body")?;
    Ok(body.to_bytes())
}
