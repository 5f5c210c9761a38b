use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use edgeguard::config::{self, Bootstrap};
use edgeguard::consul::ConsulClient;
use edgeguard::discovery::Discovery;
use edgeguard::logging;
use edgeguard::server;
use edgeguard::services::Services;

#[derive(Parser, Debug)]
#[command(name = "edgeguard", about = "HLS hotlink protection and edge routing", version)]
struct Cli {
    /// Config file path; a missing file means defaults
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Listen address
    #[arg(long = "listen", env = "LISTEN")]
    listen: Option<String>,

    #[arg(long = "log-level", env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long = "http-pprof-enable", env = "HTTP_PPROF_ENABLE")]
    http_pprof_enable: Option<bool>,

    /// Value of Access-Control-Allow-Origin on every response
    #[arg(long = "http-cors", env = "HTTP_CORS")]
    http_cors: Option<String>,

    #[arg(long = "consul-address", env = "CONSUL_ADDRESS")]
    consul_address: Option<String>,

    #[arg(long = "consul-service-nodes", env = "CONSUL_SERVICE_NODES")]
    consul_service_nodes: Option<String>,

    #[arg(long = "consul-service-cloud", env = "CONSUL_SERVICE_CLOUD")]
    consul_service_cloud: Option<String>,

    /// DNS suffix appended to registry node names
    #[arg(long = "consul-entries-domain", env = "CONSUL_ENTRIES_DOMAIN")]
    consul_entries_domain: Option<String>,

    #[arg(long = "consul-kv-prefix", env = "CONSUL_KV_PREFIX")]
    consul_kv_prefix: Option<String>,

    #[arg(long = "link-expiration", env = "LINK_EXPIRATION", value_parser = humantime::parse_duration)]
    link_expiration: Option<Duration>,

    #[arg(long = "link-secret", env = "SIGN_SECRET", hide_env_values = true)]
    link_secret: Option<String>,

    /// Lifetime of blocklist entries; 0 keeps them until removed
    #[arg(long = "ip-ban-time", env = "IP_BAN_TIME", value_parser = humantime::parse_duration)]
    ip_ban_time: Option<Duration>,

    #[arg(long = "limiter-max-req", env = "LIMITER_MAX_REQ")]
    limiter_max_req: Option<u32>,

    #[arg(long = "limiter-records-duration", env = "LIMITER_RECORDS_DURATION", value_parser = humantime::parse_duration)]
    limiter_records_duration: Option<Duration>,

    #[arg(long = "balancer-softer-step", env = "BALANCER_SOFTER_STEP")]
    balancer_softer_step: Option<u32>,

    #[arg(long = "balancer-softer-tick", env = "BALANCER_SOFTER_TICK", value_parser = humantime::parse_duration)]
    balancer_softer_tick: Option<Duration>,
}

impl Cli {
    fn apply(self, cfg: &mut Bootstrap) {
        if let Some(v) = self.listen {
            cfg.server.addr = v;
        }
        if let Some(v) = self.log_level {
            cfg.logger.level = v;
        }
        if let Some(v) = self.http_pprof_enable {
            cfg.server.pprof = v;
        }
        if let Some(v) = self.http_cors {
            cfg.server.cors = v;
        }
        if let Some(v) = self.consul_address {
            cfg.consul.address = v;
        }
        if let Some(v) = self.consul_service_nodes {
            cfg.consul.service_nodes = v;
        }
        if let Some(v) = self.consul_service_cloud {
            cfg.consul.service_cloud = v;
        }
        if let Some(v) = self.consul_entries_domain {
            cfg.consul.entries_domain = v;
        }
        if let Some(v) = self.consul_kv_prefix {
            cfg.consul.kv_prefix = v;
        }
        if let Some(v) = self.link_expiration {
            cfg.link.expiration = v;
        }
        if let Some(v) = self.link_secret {
            cfg.link.secret = v;
        }
        if let Some(v) = self.ip_ban_time {
            cfg.blocklist.ban_time = v;
        }
        if let Some(v) = self.limiter_max_req {
            cfg.limiter.max_req = v;
        }
        if let Some(v) = self.limiter_records_duration {
            cfg.limiter.records_duration = v;
        }
        if let Some(v) = self.balancer_softer_step {
            cfg.balancer.softer_step = v;
        }
        if let Some(v) = self.balancer_softer_tick {
            cfg.balancer.softer_tick = v;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let (mut cfg, ignored) = if cli.config.exists() {
        config::load(&cli.config)?
    } else {
        (Bootstrap::default(), Vec::new())
    };
    let config_path = cli.config.clone();
    cli.apply(&mut cfg);

    if cfg.hostname.is_none() {
        cfg.hostname = std::env::var("HOSTNAME").ok();
    }

    logging::init(&cfg.logger, verbose)?;

    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }
    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    let cancel = CancellationToken::new();
    let services = Services::new(cfg, cancel.clone())?;
    log::info!(
        "edgeguard starting on {} with config {}",
        services.config.server.addr,
        config_path.display()
    );

    let discovery: Option<Arc<dyn Discovery>> = if services.config.consul.address.is_empty() {
        None
    } else {
        Some(Arc::new(ConsulClient::new(&services.config.consul)))
    };
    let background = services.spawn_background(discovery);
    spawn_signal_handler(cancel.clone());

    let result = server::run(Arc::clone(&services)).await;
    cancel.cancel();
    for handle in background {
        if let Err(err) = handle.await {
            log::warn!("background task ended abnormally: {err}");
        }
    }
    log::info!("edgeguard stopped");
    result
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    log::warn!("install SIGTERM handler failed: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("SIGINT received, shutting down"),
                _ = term.recv() => log::info!("SIGTERM received, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("interrupt received, shutting down");
        }
        cancel.cancel();
    });
}
