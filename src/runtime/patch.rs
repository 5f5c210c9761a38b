use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::blocklist::Blocklist;
use crate::runtime::Runtime;
use crate::title::Quality;
use crate::upstream::Cluster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    Lottery,
    Quality,
    Blocklist,
    BlocklistIps,
    BlocklistRemove,
    Limiter,
    AccessStdout,
    AccessLevel,
    Cluster,
}

impl PatchKind {
    /// Maps a KV key (its last path segment) to a patch kind.
    pub fn from_key(key: &str) -> Option<Self> {
        let name = key.rsplit('/').next().unwrap_or(key);
        match name.to_ascii_lowercase().as_str() {
            "lottery" => Some(PatchKind::Lottery),
            "quality" => Some(PatchKind::Quality),
            "blocklist" => Some(PatchKind::Blocklist),
            "blocklist_ips" => Some(PatchKind::BlocklistIps),
            "limiter" => Some(PatchKind::Limiter),
            "access_stdout" => Some(PatchKind::AccessStdout),
            "access_level" => Some(PatchKind::AccessLevel),
            "cluster" => Some(PatchKind::Cluster),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatchKind::Lottery => "lottery",
            PatchKind::Quality => "quality",
            PatchKind::Blocklist => "blocklist",
            PatchKind::BlocklistIps => "blocklist_ips",
            PatchKind::BlocklistRemove => "blocklist_remove",
            PatchKind::Limiter => "limiter",
            PatchKind::AccessStdout => "access_stdout",
            PatchKind::AccessLevel => "access_level",
            PatchKind::Cluster => "cluster",
        }
    }
}

/// How a patch to a smoothly deployable parameter lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeployMode {
    #[default]
    Smooth,
    Instant,
}

impl DeployMode {
    /// `soft` or `hard`, as the admin surface spells them.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "soft" | "smooth" => Some(DeployMode::Smooth),
            "hard" | "instant" => Some(DeployMode::Instant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Patch {
    pub kind: PatchKind,
    pub payload: Bytes,
    pub mode: DeployMode,
}

impl Patch {
    pub fn new(kind: PatchKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            mode: DeployMode::Smooth,
        }
    }

    pub fn with_mode(mut self, mode: DeployMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("{0}: payload is not utf-8")]
    NotUtf8(&'static str),
    #[error("{0}: invalid value {1:?}")]
    Invalid(&'static str, String),
    #[error("{0}: {1} is out of range 0..=100")]
    OutOfRange(&'static str, i64),
}

/// Applies typed patches onto the runtime store and the blocklist.
#[derive(Clone)]
pub struct Patcher {
    runtime: Arc<Runtime>,
    blocklist: Arc<Blocklist>,
}

impl Patcher {
    pub fn new(runtime: Arc<Runtime>, blocklist: Arc<Blocklist>) -> Self {
        Self { runtime, blocklist }
    }

    /// Applies a patch. Rejected patches are logged and leave every value as it was.
    pub async fn apply(&self, patch: &Patch) -> Result<(), PatchError> {
        let kind = patch.kind.as_str();
        let result = self.apply_inner(patch).await;
        match &result {
            Ok(()) => log::debug!("runtime patch {kind} applied"),
            Err(err) => log::warn!("runtime patch rejected: {err}"),
        }
        crate::metrics::record_patch(kind, result.is_ok());
        result
    }

    async fn apply_inner(&self, patch: &Patch) -> Result<(), PatchError> {
        let kind = patch.kind.as_str();
        let raw = std::str::from_utf8(&patch.payload)
            .map_err(|_| PatchError::NotUtf8(kind))?
            .trim();

        match patch.kind {
            PatchKind::Lottery => {
                let chance: i64 = raw.parse().map_err(|_| PatchError::Invalid(kind, raw.to_string()))?;
                if !(0..=100).contains(&chance) {
                    return Err(PatchError::OutOfRange(kind, chance));
                }
                self.deploy(&self.runtime.lottery, chance as u8, patch.mode).await;
            }
            PatchKind::Quality => {
                let quality = Quality::parse(raw).ok_or_else(|| PatchError::Invalid(kind, raw.to_string()))?;
                self.deploy(&self.runtime.quality, quality, patch.mode).await;
            }
            PatchKind::Cluster => {
                let cluster = Cluster::parse(raw).ok_or_else(|| PatchError::Invalid(kind, raw.to_string()))?;
                self.deploy(&self.runtime.cluster, cluster, patch.mode).await;
            }
            PatchKind::BlocklistIps => {
                if raw.is_empty() {
                    return Err(PatchError::Invalid(kind, raw.to_string()));
                }
                if raw == "_" {
                    self.blocklist.reset();
                    log::info!("blocklist reset");
                } else {
                    let ips: Vec<&str> = raw.split(',').map(str::trim).filter(|ip| !ip.is_empty()).collect();
                    self.blocklist.push(&ips);
                    log::info!("blocklist extended with {} addresses", ips.len());
                }
            }
            PatchKind::BlocklistRemove => {
                if raw.is_empty() {
                    return Err(PatchError::Invalid(kind, raw.to_string()));
                }
                for ip in raw.split(',').map(str::trim).filter(|ip| !ip.is_empty()) {
                    self.blocklist.remove(ip);
                }
            }
            PatchKind::Blocklist => {
                let enabled = parse_flag(kind, raw)?;
                self.runtime.blocklist.set(enabled);
                self.blocklist.set_enabled(enabled);
            }
            PatchKind::Limiter => {
                self.runtime.limiter.set(parse_flag(kind, raw)?);
            }
            PatchKind::AccessStdout => {
                self.runtime.access_stdout.set(parse_flag(kind, raw)?);
            }
            PatchKind::AccessLevel => {
                let level = crate::logging::parse_level(raw).ok_or_else(|| PatchError::Invalid(kind, raw.to_string()))?;
                self.runtime.access_level.set(level);
                crate::logging::set_level(level);
            }
        }
        Ok(())
    }

    async fn deploy<T>(&self, entry: &Arc<crate::runtime::Entry<T>>, value: T, mode: DeployMode)
    where
        T: Copy + PartialEq + std::fmt::Debug + Send + Sync + 'static,
    {
        match mode {
            DeployMode::Smooth => entry.set_smoothly(value).await,
            DeployMode::Instant => entry.set(value),
        }
    }
}

fn parse_flag(kind: &'static str, raw: &str) -> Result<bool, PatchError> {
    match raw {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(PatchError::Invalid(kind, raw.to_string())),
    }
}
