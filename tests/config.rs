use std::time::Duration;

use edgeguard::config;
use edgeguard::runtime::RuntimeDefaults;
use edgeguard::title::{Quality, TitleSeries};
use edgeguard::upstream::Cluster;
use log::LevelFilter;

const FULL: &str = r#"
strict: true
logger:
  level: debug
  path: /var/log/edgeguard/edgeguard.log
server:
  addr: 0.0.0.0:9000
  pprof: true
  local_api_allow_hosts: [admin.internal]
consul:
  address: http://127.0.0.1:8500
  service_nodes: cache-nodes
  service_cloud: cache-cloud
  entries_domain: edge.example
  wait: 2m
link:
  expiration: 30m
  secret: s3cret
limiter:
  max_req: 50
  records_duration: 10s
blocklist:
  ban_time: 1h
balancer:
  softer_step: 5
  softer_tick: 15s
  lottery: 70
  quality: 720
  cluster: cloud
title_series:
  - title: 9277
    serie: 13
    hashes:
      "720": 3ae5aa5839690b8d9ea9fcef9b720fb4
"#;

#[test]
fn test_parse_full_config() {
    let (cfg, ignored) = config::parse(FULL).unwrap();
    assert!(ignored.is_empty(), "{ignored:?}");
    assert!(cfg.strict);
    assert_eq!(cfg.server.addr, "0.0.0.0:9000");
    assert_eq!(cfg.server.local_api_allow_hosts, vec!["admin.internal".to_string()]);
    assert_eq!(cfg.consul.wait, Duration::from_secs(120));
    assert_eq!(cfg.consul.kv_prefix, "edgeguard/runtime");
    assert_eq!(cfg.link.expiration, Duration::from_secs(1800));
    assert_eq!(cfg.limiter.max_req, 50);
    assert_eq!(cfg.limiter.prune_interval, Duration::from_secs(60));
    assert_eq!(cfg.blocklist.ban_time, Duration::from_secs(3600));
    assert!(cfg.blocklist.enabled);
    cfg.validate().unwrap();

    let defaults = RuntimeDefaults::from_config(&cfg);
    assert_eq!(defaults.lottery, 70);
    assert_eq!(defaults.quality, Quality::Hd);
    assert_eq!(defaults.cluster, Cluster::Cloud);
    assert_eq!(defaults.access_level, LevelFilter::Debug);
    assert_eq!(defaults.softer_tick, Duration::from_secs(15));

    let titles = TitleSeries::from_seeds(&cfg.title_series).unwrap();
    assert_eq!(
        titles.hash_for(9277, 13, Quality::Hd).as_deref(),
        Some("3ae5aa5839690b8d9ea9fcef9b720fb4")
    );
    assert_eq!(titles.hash_for(9277, 13, Quality::Fhd), None);
}

#[test]
fn test_unknown_fields_are_reported() {
    let raw = "server:\n  addr: 127.0.0.1:1\n  listen_backlog: 10\nmystery: 1\n";
    let (cfg, ignored) = config::parse(raw).unwrap();
    assert_eq!(cfg.server.addr, "127.0.0.1:1");
    assert!(ignored.contains(&"server.listen_backlog".to_string()), "{ignored:?}");
    assert!(ignored.contains(&"mystery".to_string()), "{ignored:?}");
}

#[test]
fn test_defaults() {
    let (cfg, _) = config::parse("{}").unwrap();
    assert_eq!(cfg.limiter.max_req, 300);
    assert_eq!(cfg.limiter.records_duration, Duration::from_secs(60));
    assert_eq!(cfg.balancer.lottery, 100);
    assert_eq!(cfg.balancer.quality, 1080);
    assert_eq!(cfg.link.expiration, Duration::from_secs(4 * 3600));
    assert!(cfg.consul.address.is_empty());

    // no secret configured
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_bad_values() {
    let (mut cfg, _) = config::parse(FULL).unwrap();
    cfg.balancer.softer_step = 0;
    assert!(cfg.validate().is_err());

    let (mut cfg, _) = config::parse(FULL).unwrap();
    cfg.limiter.records_duration = Duration::ZERO;
    assert!(cfg.validate().is_err());

    let (mut cfg, _) = config::parse(FULL).unwrap();
    cfg.server.addr = " ".to_string();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_out_of_range_defaults_are_clamped() {
    let (cfg, _) = config::parse("balancer:\n  lottery: 250\n  quality: 360\n  cluster: moon\n").unwrap();
    let defaults = RuntimeDefaults::from_config(&cfg);
    assert_eq!(defaults.lottery, 100);
    assert_eq!(defaults.quality, Quality::Fhd);
    assert_eq!(defaults.cluster, Cluster::Nodes);

    assert!(config::parse("balancer:\n  softer_tick: soon\n").is_err());
}

#[test]
fn test_bad_title_seed_quality() {
    let raw = "title_series:\n  - title: 1\n    serie: 1\n    hashes:\n      \"360\": abc\n";
    let (cfg, _) = config::parse(raw).unwrap();
    assert!(TitleSeries::from_seeds(&cfg.title_series).is_err());
}
