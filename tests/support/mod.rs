#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use edgeguard::config::{Bootstrap, TitleSerieSeed};
use edgeguard::constants;
use edgeguard::discovery::{Discovery, KvEntry, ServiceInstance};
use edgeguard::middleware::{BoxFuture, HttpResponse};
use edgeguard::services::Services;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const CHUNK_URI: &str = "/videos/media/ts/9277/13/720/3ae5aa5839690b8d9ea9fcef9b720fb4_00028.ts";
pub const FHD_CHUNK_URI: &str = "/videos/media/ts/9277/13/1080/0f1e2d3c4b5a69788796a5b4c3d2e1f0_00028.ts";
pub const HD_HASH: &str = "3ae5aa5839690b8d9ea9fcef9b720fb4";
pub const UID: &str = "AB12cd34";

pub fn test_config() -> Bootstrap {
    let mut cfg = Bootstrap::default();
    cfg.link.secret = "secret".to_string();
    cfg.link.expiration = Duration::from_secs(3600);
    cfg.access_log.path = String::new();
    cfg.balancer.softer_step = 4;
    cfg.balancer.softer_tick = Duration::from_millis(20);
    cfg.balancer.lottery = 100;
    cfg.balancer.quality = 1080;
    cfg.consul.retry_interval = Duration::from_millis(10);
    let mut hashes = HashMap::new();
    hashes.insert("720".to_string(), HD_HASH.to_string());
    cfg.title_series = vec![TitleSerieSeed {
        title: 9277,
        serie: 13,
        hashes,
    }];
    cfg
}

pub fn build_services(cfg: Bootstrap) -> Arc<Services> {
    Services::new(cfg, CancellationToken::new()).expect("services")
}

/// Nodes cluster with the given `name -> ip` servers.
pub fn with_nodes(services: &Services, servers: &[(&str, &str)]) {
    let snapshot: HashMap<String, String> = servers
        .iter()
        .map(|(name, ip)| (name.to_string(), ip.to_string()))
        .collect();
    services.clusters.nodes.update_upstream(&snapshot);
}

/// A pipeline request carrying the trusted proxy headers.
pub fn client_request(uri: &str, source_ip: &str) -> Request<()> {
    Request::builder()
        .method(Method::GET)
        .uri("/")
        .header(constants::CLIENT_URI_KEY, uri)
        .header(constants::CLIENT_ID_KEY, format!("uid={UID}"))
        .header(constants::CACHE_SERVER_KEY, "10.0.0.1")
        .header(constants::FORWARDED_FOR_KEY, source_ip)
        .body(())
        .expect("request")
}

pub fn location(resp: &HttpResponse) -> Option<http::Uri> {
    resp.headers()
        .get(constants::LOCATION_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

pub fn query_param(uri: &http::Uri, key: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|part| part.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

pub async fn body_string(resp: HttpResponse) -> String {
    let body = resp.into_body().collect().await.expect("body").to_bytes();
    String::from_utf8_lossy(&body).into_owned()
}

/// Serves `services` on an ephemeral port until its cancel token fires.
pub async fn start_server(services: Arc<Services>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = edgeguard::server::serve(listener, services).await;
    });
    addr
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone)]
pub struct TestClient {
    addr: SocketAddr,
}

impl TestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn send(&self, method: Method, host: &str, path: &str, headers: HeaderMap, body: &str) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.addr).await.expect("connect");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, host);
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        if !body.is_empty() {
            builder = builder.header("content-type", "application/x-www-form-urlencoded");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.to_string())))
            .expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();
        TestResponse { status, headers, body }
    }

    pub async fn admin_get(&self, path: &str) -> TestResponse {
        self.send(Method::GET, "localhost", path, HeaderMap::new(), "").await
    }

    pub async fn admin_post(&self, path: &str, form: &str) -> TestResponse {
        self.send(Method::POST, "localhost", path, HeaderMap::new(), form).await
    }
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(http::Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder.body(Full::new(body)).unwrap()
}

/// In-memory registry answering from queued scripts. Once a queue runs dry
/// the last answer repeats, like a blocking query that keeps timing out.
#[derive(Default)]
pub struct ScriptedDiscovery {
    services: Mutex<VecDeque<Result<(Vec<ServiceInstance>, u64), String>>>,
    last_service: Mutex<Option<Result<(Vec<ServiceInstance>, u64), String>>>,
    kv: Mutex<VecDeque<(Vec<KvEntry>, u64)>>,
    last_kv: Mutex<Option<(Vec<KvEntry>, u64)>>,
    pub service_calls: Mutex<Vec<u64>>,
}

impl ScriptedDiscovery {
    pub fn push_service(&self, instances: Vec<ServiceInstance>, index: u64) {
        self.services.lock().unwrap().push_back(Ok((instances, index)));
    }

    pub fn push_service_error(&self, message: &str) {
        self.services.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn push_kv(&self, entries: Vec<KvEntry>, index: u64) {
        self.kv.lock().unwrap().push_back((entries, index));
    }
}

impl Discovery for ScriptedDiscovery {
    fn health_service(
        &self,
        _name: &str,
        _passing_only: bool,
        wait_index: u64,
    ) -> BoxFuture<Result<(Vec<ServiceInstance>, u64)>> {
        self.service_calls.lock().unwrap().push(wait_index);
        let next = self.services.lock().unwrap().pop_front();
        let answer = match next {
            Some(answer) => {
                *self.last_service.lock().unwrap() = Some(answer.clone());
                answer
            }
            None => self
                .last_service
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err("no script".to_string())),
        };
        Box::pin(async move { answer.map_err(|msg| anyhow!(msg)) })
    }

    fn kv_list(&self, _prefix: &str, _wait_index: u64) -> BoxFuture<Result<(Vec<KvEntry>, u64)>> {
        let next = self.kv.lock().unwrap().pop_front();
        let answer = match next {
            Some(answer) => {
                *self.last_kv.lock().unwrap() = Some(answer.clone());
                Ok(answer)
            }
            None => self
                .last_kv
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| "no script".to_string()),
        };
        Box::pin(async move { answer.map_err(|msg| anyhow!(msg)) })
    }
}

pub fn instance(node: &str, ip: &str) -> ServiceInstance {
    ServiceInstance {
        node_name: node.to_string(),
        node_ip: ip.to_string(),
        service_port: 80,
    }
}

pub fn kv(key: &str, value: &str, index: u64) -> KvEntry {
    KvEntry {
        key: key.to_string(),
        value: Some(Bytes::from(value.to_string())),
        mod_index: index,
    }
}

/// Polls `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
