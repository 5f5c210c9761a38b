use std::fmt::Write as _;
use std::sync::Arc;

use log::LevelFilter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Bootstrap;
use crate::title::Quality;
use crate::upstream::Cluster;

pub mod entry;
pub mod patch;

pub use entry::{Entry, Snapshot};
pub use patch::{DeployMode, Patch, PatchError, PatchKind, Patcher};

#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
    pub build_time: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_REV").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown"),
    }
}

/// Mutable policy knobs, one typed entry per parameter.
pub struct Runtime {
    /// Percentage of requests routed through the hash balancer.
    pub lottery: Arc<Entry<u8>>,
    /// Highest quality served; anything above is rewritten down to it.
    pub quality: Arc<Entry<Quality>>,
    pub blocklist: Arc<Entry<bool>>,
    pub limiter: Arc<Entry<bool>>,
    pub access_stdout: Arc<Entry<bool>>,
    pub access_level: Arc<Entry<LevelFilter>>,
    pub cluster: Arc<Entry<Cluster>>,
}

#[derive(Debug, Clone)]
pub struct RuntimeDefaults {
    pub lottery: u8,
    pub quality: Quality,
    pub blocklist: bool,
    pub limiter: bool,
    pub access_stdout: bool,
    pub access_level: LevelFilter,
    pub cluster: Cluster,
    pub softer_step: u32,
    pub softer_tick: std::time::Duration,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            lottery: 100,
            quality: Quality::Fhd,
            blocklist: true,
            limiter: true,
            access_stdout: false,
            access_level: LevelFilter::Info,
            cluster: Cluster::Nodes,
            softer_step: 10,
            softer_tick: std::time::Duration::from_secs(30),
        }
    }
}

impl RuntimeDefaults {
    pub fn from_config(cfg: &Bootstrap) -> Self {
        let defaults = Self::default();
        Self {
            lottery: cfg.balancer.lottery.min(100),
            quality: Quality::from_lines(cfg.balancer.quality).unwrap_or(defaults.quality),
            blocklist: cfg.blocklist.enabled,
            limiter: true,
            access_stdout: cfg.access_log.stdout,
            access_level: crate::logging::parse_level(&cfg.logger.level).unwrap_or(defaults.access_level),
            cluster: Cluster::parse(&cfg.balancer.cluster).unwrap_or(defaults.cluster),
            softer_step: cfg.balancer.softer_step,
            softer_tick: cfg.balancer.softer_tick,
        }
    }
}

impl Runtime {
    pub fn new(defaults: RuntimeDefaults, cancel: CancellationToken) -> Self {
        let steps = defaults.softer_step;
        let tick = defaults.softer_tick;
        Self {
            lottery: Entry::new("lottery", defaults.lottery, steps, tick, cancel.clone()),
            quality: Entry::new("quality", defaults.quality, steps, tick, cancel.clone()),
            blocklist: Entry::new("blocklist", defaults.blocklist, steps, tick, cancel.clone()),
            limiter: Entry::new("limiter", defaults.limiter, steps, tick, cancel.clone()),
            access_stdout: Entry::new("access_stdout", defaults.access_stdout, steps, tick, cancel.clone()),
            access_level: Entry::new("access_level", defaults.access_level, steps, tick, cancel.clone()),
            cluster: Entry::new("cluster", defaults.cluster, steps, tick, cancel),
        }
    }

    /// Plain-text table of every parameter.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:<14} {:<8} {:<10} {}", "param", "current", "candidate", "step");
        dump_entry(&mut out, self.lottery.as_ref(), |v| v.to_string());
        dump_entry(&mut out, self.quality.as_ref(), |v| v.to_string());
        dump_entry(&mut out, self.blocklist.as_ref(), flag);
        dump_entry(&mut out, self.limiter.as_ref(), flag);
        dump_entry(&mut out, self.access_stdout.as_ref(), flag);
        dump_entry(&mut out, self.access_level.as_ref(), |v| v.as_str().to_ascii_lowercase());
        dump_entry(&mut out, self.cluster.as_ref(), |v| v.to_string());
        out
    }
}

fn flag(value: bool) -> String {
    let raw = if value { "1" } else { "0" };
    raw.to_string()
}

fn dump_entry<T, F>(out: &mut String, entry: &Entry<T>, fmt: F)
where
    T: Copy + PartialEq + std::fmt::Debug + Send + Sync + 'static,
    F: Fn(T) -> String,
{
    let snap = entry.snapshot();
    let candidate = snap.candidate.map(&fmt).unwrap_or_else(|| "-".to_string());
    let _ = writeln!(
        out,
        "{:<14} {:<8} {:<10} {}",
        entry.name(),
        fmt(snap.current),
        candidate,
        snap.step
    );
}
