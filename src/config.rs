use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub consul: Consul,
    #[serde(default)]
    pub link: Link,
    #[serde(default)]
    pub limiter: Limiter,
    #[serde(default)]
    pub blocklist: Blocklist,
    #[serde(default)]
    pub balancer: Balancer,
    #[serde(default)]
    pub access_log: AccessLog,
    #[serde(default)]
    pub title_series: Vec<TitleSerieSeed>,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.link.secret.is_empty() {
            return Err(anyhow!("link.secret is required (flag link-secret or SIGN_SECRET)"));
        }
        if self.balancer.softer_step == 0 {
            return Err(anyhow!("balancer.softer_step must be positive"));
        }
        if self.limiter.max_req == 0 || self.limiter.records_duration.is_zero() {
            return Err(anyhow!("limiter.max_req and limiter.records_duration must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Logger {
    pub level: String,
    pub path: String,
    pub caller: bool,
    pub traceid: bool,
    pub max_size: u64,
    pub max_backups: u64,
    pub nopid: bool,
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            path: String::new(),
            caller: false,
            traceid: true,
            max_size: 0,
            max_backups: 0,
            nopid: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Server {
    pub addr: String,
    pub pprof: bool,
    pub cors: String,
    pub local_api_allow_hosts: Vec<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            pprof: false,
            cors: String::new(),
            local_api_allow_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Consul {
    /// Agent base url, e.g. `http://127.0.0.1:8500`. Empty disables discovery.
    pub address: String,
    pub service_nodes: String,
    pub service_cloud: String,
    /// DNS suffix appended to discovered node names.
    pub entries_domain: String,
    pub kv_prefix: String,
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for Consul {
    fn default() -> Self {
        Self {
            address: String::new(),
            service_nodes: String::new(),
            service_cloud: String::new(),
            entries_domain: String::new(),
            kv_prefix: "edgeguard/runtime".to_string(),
            wait: Duration::from_secs(300),
            retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Link {
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,
    pub secret: String,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(4 * 60 * 60),
            secret: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Limiter {
    pub max_req: u32,
    #[serde(with = "humantime_serde")]
    pub records_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for Limiter {
    fn default() -> Self {
        Self {
            max_req: 300,
            records_duration: Duration::from_secs(60),
            prune_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Blocklist {
    /// Zero keeps banned addresses until they are removed explicitly.
    #[serde(with = "humantime_serde")]
    pub ban_time: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    pub enabled: bool,
}

impl Default for Blocklist {
    fn default() -> Self {
        Self {
            ban_time: Duration::ZERO,
            sweep_interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Balancer {
    pub softer_step: u32,
    #[serde(with = "humantime_serde")]
    pub softer_tick: Duration,
    pub lottery: u8,
    pub quality: u16,
    pub cluster: String,
}

impl Default for Balancer {
    fn default() -> Self {
        Self {
            softer_step: 10,
            softer_tick: Duration::from_secs(30),
            lottery: 100,
            quality: 1080,
            cluster: "nodes".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AccessLog {
    pub path: String,
    pub stdout: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct TitleSerieSeed {
    pub title: u16,
    pub serie: u16,
    /// Quality literal (`480`, `720`, `1080`) to content hash.
    #[serde(default)]
    pub hashes: HashMap<String, String>,
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;

    Ok((cfg, ignored))
}
