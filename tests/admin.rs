mod support;

use std::time::Duration;

use edgeguard::constants;
use edgeguard::runtime::DeployMode;
use edgeguard::title::Quality;
use edgeguard::upstream::Cluster;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use support::{
    build_services, start_server, test_config, with_nodes, TestClient, CHUNK_URI, FHD_CHUNK_URI, HD_HASH, UID,
};

fn client_headers(uri: &str, source_ip: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(constants::CLIENT_URI_KEY, HeaderValue::from_str(uri).unwrap());
    headers.insert(constants::CLIENT_ID_KEY, HeaderValue::from_str(&format!("uid={UID}")).unwrap());
    headers.insert(constants::CACHE_SERVER_KEY, HeaderValue::from_static("10.0.0.1"));
    headers.insert(constants::FORWARDED_FOR_KEY, HeaderValue::from_str(source_ip).unwrap());
    headers
}

#[tokio::test]
async fn test_health_probes_and_version() {
    let services = build_services(test_config());
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client.admin_get("/healthz/liveness-probe").await;
    assert_eq!(resp.status, StatusCode::OK);
    let resp = client.admin_get("/healthz/readiness-probe").await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = client.admin_get("/version").await;
    assert_eq!(resp.status, StatusCode::OK);
    let info: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(info["name"], "edgeguard");
    assert!(info["version"].is_string());

    let resp = client.admin_get("/nowhere").await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    // profiling stays off unless enabled
    let resp = client.admin_get("/debug/pprof/profile?seconds=1").await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    services.cancel.cancel();
}

#[tokio::test]
async fn test_readiness_waits_for_discovery() {
    let mut cfg = test_config();
    cfg.consul.address = "127.0.0.1:1".to_string();
    let services = build_services(cfg);
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client.admin_get("/healthz/readiness-probe").await;
    assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);

    with_nodes(&services, &[("cache-1.example", "10.1.0.1")]);
    let resp = client.admin_get("/healthz/readiness-probe").await;
    assert_eq!(resp.status, StatusCode::OK);

    services.cancel.cancel();
}

#[tokio::test]
async fn test_request_id_and_cors_headers() {
    let mut cfg = test_config();
    cfg.server.cors = "*".to_string();
    let services = build_services(cfg);
    let client = TestClient::new(start_server(services.clone()).await);

    let mut headers = HeaderMap::new();
    headers.insert(constants::PROTOCOL_REQUEST_ID_KEY, HeaderValue::from_static("req-42"));
    let resp = client
        .send(Method::GET, "localhost", "/healthz/liveness-probe", headers, "")
        .await;
    assert_eq!(resp.headers[constants::PROTOCOL_REQUEST_ID_KEY], "req-42");
    assert_eq!(resp.headers["access-control-allow-origin"], "*");

    let resp = client.admin_get("/healthz/liveness-probe").await;
    let generated = resp.headers[constants::PROTOCOL_REQUEST_ID_KEY].to_str().unwrap();
    assert_eq!(generated.len(), 32);
    assert!(generated.chars().all(|c| c.is_ascii_hexdigit()));

    services.cancel.cancel();
}

#[tokio::test]
async fn test_foreign_host_goes_through_pipeline() {
    let services = build_services(test_config());
    with_nodes(&services, &[("cache-1.example", "10.1.0.1")]);
    let client = TestClient::new(start_server(services.clone()).await);

    // admin paths are not reachable from outside
    let resp = client
        .send(Method::GET, "edge.example.com", "/api/runtime", HeaderMap::new(), "")
        .await;
    assert_eq!(resp.status, StatusCode::PRECONDITION_FAILED);
    assert!(resp.headers.contains_key(constants::ERROR_KEY));

    let resp = client
        .send(
            Method::GET,
            "edge.example.com",
            "/",
            client_headers(CHUNK_URI, "203.0.113.9"),
            "",
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    let location = resp.headers[constants::LOCATION_KEY].to_str().unwrap();
    assert!(location.starts_with("https://cache-1.example/videos/media/ts/9277/13/720/"));
    assert!(location.contains("expires=") && location.contains("&extra="));

    let resp = client.admin_get("/metrics").await;
    assert_eq!(resp.status, StatusCode::OK);
    let body = resp.text();
    assert!(body.contains("edgeguard_requests_total"));
    assert!(body.contains("edgeguard_balance_total"));

    services.cancel.cancel();
}

#[tokio::test]
async fn test_upstream_table_and_reset() {
    let services = build_services(test_config());
    with_nodes(
        &services,
        &[("cache-1.example", "10.1.0.1"), ("cache-2.example", "10.1.0.2")],
    );
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client
        .send(Method::GET, "edge.example.com", "/", client_headers(CHUNK_URI, "203.0.113.9"), "")
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = client.admin_get("/api/upstream").await;
    assert_eq!(resp.status, StatusCode::OK);
    let table = resp.text();
    assert!(table.starts_with("name"));
    assert!(table.contains("cache-1.example") && table.contains("10.1.0.2"));
    assert!(table.contains("2 servers, 2 live"));
    let handled: u64 = services.clusters.nodes.servers().iter().map(|s| s.stats().handled_requests).sum();
    assert_eq!(handled, 1);

    let resp = client.admin_get("/api/reset?cluster=nodes").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(services.clusters.nodes.servers().iter().all(|s| s.stats().handled_requests == 0));

    let resp = client.admin_get("/api/upstream?cluster=cloud").await;
    assert!(resp.text().contains("0 servers, 0 live"));
    let resp = client.admin_get("/api/upstream?cluster=moon").await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    services.cancel.cancel();
}

#[tokio::test]
async fn test_blocklist_endpoints() {
    let services = build_services(test_config());
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client.admin_post("/api/blocklist/add", "ip=198.51.100.1,198.51.100.2").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.text(), "ok\n");
    assert!(services.blocklist.contains("198.51.100.1"));

    let resp = client.admin_get("/api/blocklist").await;
    assert_eq!(resp.text(), "enabled 1\nsize 2\n");

    let resp = client.admin_post("/api/blocklist/remove?ip=198.51.100.1", "").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(!services.blocklist.contains("198.51.100.1"));

    let resp = client
        .send(Method::GET, "edge.example.com", "/", client_headers(CHUNK_URI, "198.51.100.2"), "")
        .await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    let resp = client.admin_post("/api/blocklist/switch", "enabled=0").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(!services.runtime.blocklist.current());
    assert!(!services.blocklist.contains("198.51.100.2"));

    let resp = client.admin_post("/api/blocklist/switch", "enabled=1").await;
    assert_eq!(resp.status, StatusCode::OK);
    let resp = client.admin_post("/api/blocklist/reset", "").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(services.blocklist.size(), 0);

    services.cancel.cancel();
}

#[tokio::test]
async fn test_form_values_are_decoded() {
    let services = build_services(test_config());
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client.admin_post("/api/blocklist/add", "ip=%3A%3A1%2C+203.0.113.9").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(services.blocklist.contains("::1"));
    assert!(services.blocklist.contains("203.0.113.9"));
    assert!(!services.blocklist.contains("%3A%3A1"));

    let resp = client.admin_post("/api/blocklist/remove?ip=%3A%3A1", "").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(!services.blocklist.contains("::1"));

    let params = edgeguard::admin::parse_params("ip=%3A%3A1&level=warn&note=a+b&flag");
    assert_eq!(params["ip"], "::1");
    assert_eq!(params["level"], "warn");
    assert_eq!(params["note"], "a b");
    assert_eq!(params["flag"], "");

    services.cancel.cancel();
}

#[tokio::test]
async fn test_access_log_shows_rewritten_uri() {
    let dir = std::env::temp_dir().join(format!("edgeguard-access-{}", std::process::id()));
    let path = dir.join("access.log");
    let _ = std::fs::remove_file(&path);
    let mut cfg = test_config();
    cfg.balancer.quality = 720;
    cfg.access_log.path = path.display().to_string();
    let services = build_services(cfg);
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client
        .send(Method::GET, "edge.example.com", "/", client_headers(FHD_CHUNK_URI, "1.2.3.4"), "")
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let logged = std::fs::read_to_string(&path).unwrap();
    let line = logged.lines().last().unwrap();
    assert!(line.starts_with("1.2.3.4 "), "{line}");
    assert!(line.contains(&format!("/videos/media/ts/9277/13/720/{HD_HASH}_00028.ts")), "{line}");
    assert!(!line.contains("/1080/"), "{line}");

    services.cancel.cancel();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_deploy_endpoints() {
    let services = build_services(test_config());
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client.admin_post("/api/quality", "level=720&mode=hard").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(services.runtime.quality.current(), Quality::Hd);

    let resp = client.admin_post("/api/lottery", "chance=40").await;
    assert_eq!(resp.status, StatusCode::OK);
    let snap = services.runtime.lottery.snapshot();
    assert!(snap.candidate == Some(40) || snap.current == 40);
    let done = support::eventually(Duration::from_secs(2), || {
        services.runtime.lottery.current() == 40 && !services.runtime.lottery.is_deploying()
    })
    .await;
    assert!(done, "lottery deploy never finished");

    let resp = client.admin_post("/api/cluster", "name=cloud&mode=instant").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(services.runtime.cluster.current(), Cluster::Cloud);

    let resp = client.admin_post("/api/limiter", "enabled=0").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(!services.runtime.limiter.current());
    let resp = client.admin_post("/api/access/stdout", "enabled=1").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(services.runtime.access_stdout.current());
    let resp = client.admin_post("/api/logger/level", "level=warn").await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = client.admin_get("/api/runtime").await;
    let dump = resp.text();
    let cluster = dump.lines().find(|l| l.starts_with("cluster")).unwrap();
    assert!(cluster.contains("cloud"));

    services.cancel.cancel();
}

#[tokio::test]
async fn test_admin_rejections() {
    let services = build_services(test_config());
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client.admin_get("/api/blocklist/add?ip=1.1.1.1").await;
    assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
    let resp = client.admin_post("/api/runtime", "").await;
    assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
    let resp = client.admin_get("/api/unknown").await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let resp = client.admin_post("/api/lottery", "").await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert!(resp.text().contains("chance"));
    let resp = client.admin_post("/api/lottery", "chance=150").await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let resp = client.admin_post("/api/quality", "level=720&mode=later").await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let resp = client.admin_post("/api/cluster", "name=moon").await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    assert_eq!(services.runtime.lottery.current(), 100);
    assert!(!services.runtime.lottery.is_deploying());
    assert_eq!(services.runtime.quality.current(), Quality::Fhd);
    assert_eq!(services.runtime.cluster.current(), Cluster::Nodes);
    assert_eq!(DeployMode::default(), DeployMode::Smooth);

    services.cancel.cancel();
}

#[tokio::test]
async fn test_title_serie_endpoint() {
    let services = build_services(test_config());
    let client = TestClient::new(start_server(services.clone()).await);

    let resp = client
        .admin_post("/api/titleserie", "title=100&serie=2&quality=480&hash=abcdef")
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(services.titles.hash_for(100, 2, Quality::Sd).as_deref(), Some("abcdef"));

    let resp = client
        .admin_post("/api/titleserie", "title=100&serie=2&quality=360&hash=abcdef")
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let resp = client.admin_post("/api/titleserie", "title=x&serie=2&quality=480&hash=a").await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let resp = client.admin_post("/api/titleserie", "title=1&serie=2").await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    services.cancel.cancel();
}
