use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("metric definition");
    let _ = registry().register(Box::new(counter.clone()));
    counter
}

fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("edgeguard_requests_total", "Total requests").expect("metric definition");
        let _ = registry().register(Box::new(counter.clone()));
        counter
    })
}

fn requests_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("edgeguard_requests_status_total", "Requests by status", &["code"]))
}

fn balance_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "edgeguard_balance_total",
            "Balancer outcomes by cluster",
            &["cluster", "result"],
        )
    })
}

fn lottery_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("edgeguard_lottery_total", "Lottery draws", &["result"]))
}

fn denied_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("edgeguard_denied_total", "Policy denials", &["reason"]))
}

fn patches_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "edgeguard_runtime_patches_total",
            "Runtime patches by kind",
            &["kind", "result"],
        )
    })
}

fn discovery_failures_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "edgeguard_discovery_failures_total",
            "Failed discovery polls",
            &["watch"],
        )
    })
}

fn recovered_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("edgeguard_recovered_panics_total", "Panics caught in request handling")
            .expect("metric definition");
        let _ = registry().register(Box::new(counter.clone()));
        counter
    })
}

fn servers_gauge() -> &'static IntGaugeVec {
    static METRIC: OnceLock<IntGaugeVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("edgeguard_upstream_servers", "Upstream servers by state"),
            &["cluster", "state"],
        )
        .expect("metric definition");
        let _ = registry().register(Box::new(gauge.clone()));
        gauge
    })
}

pub fn record(status: StatusCode) {
    requests_total().inc();
    let code = status.as_u16().to_string();
    requests_status_total().with_label_values(&[code.as_str()]).inc();
}

pub fn record_balance(cluster: &str, result: &str) {
    balance_total().with_label_values(&[cluster, result]).inc();
}

pub fn record_lottery(won: bool) {
    let result = if won { "hash" } else { "skip" };
    lottery_total().with_label_values(&[result]).inc();
}

pub fn record_denied(reason: &str) {
    denied_total().with_label_values(&[reason]).inc();
}

pub fn record_patch(kind: &str, ok: bool) {
    let result = if ok { "applied" } else { "rejected" };
    patches_total().with_label_values(&[kind, result]).inc();
}

pub fn record_discovery_failure(watch: &str) {
    discovery_failures_total().with_label_values(&[watch]).inc();
}

pub fn record_recovered() {
    recovered_total().inc();
}

pub fn set_servers(cluster: &str, live: usize, total: usize) {
    servers_gauge()
        .with_label_values(&[cluster, "live"])
        .set(live as i64);
    servers_gauge()
        .with_label_values(&[cluster, "down"])
        .set(total.saturating_sub(live) as i64);
}

pub fn render() -> String {
    let _ = requests_total();
    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
