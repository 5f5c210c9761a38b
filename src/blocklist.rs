use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Banned source addresses. Entries carry an expiry when a ban time is set.
pub struct Blocklist {
    entries: RwLock<HashMap<String, Option<Instant>>>,
    enabled: AtomicBool,
    ban_time: Duration,
    sweeping: Mutex<()>,
}

impl Blocklist {
    pub fn new(enabled: bool, ban_time: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(enabled),
            ban_time,
            sweeping: Mutex::new(()),
        }
    }

    /// Adds addresses. A disabled list accepts the call and stores nothing.
    pub fn push<I, S>(&self, ips: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.enabled() {
            return;
        }
        let expires = if self.ban_time.is_zero() {
            None
        } else {
            Some(Instant::now() + self.ban_time)
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for ip in ips {
            let ip = ip.as_ref().trim();
            if ip.is_empty() {
                continue;
            }
            entries.insert(ip.to_string(), expires);
        }
    }

    pub fn remove(&self, ip: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(ip.trim()).is_some()
    }

    pub fn reset(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn contains(&self, ip: &str) -> bool {
        if !self.enabled() {
            return false;
        }
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(ip) {
            Some(Some(expires)) => *expires > Instant::now(),
            Some(None) => true,
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Drops expired entries. Returns `None` when another sweep holds the lock.
    pub fn sweep(&self) -> Option<usize> {
        let _guard = self.sweeping.try_lock().ok()?;
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, expires| match expires {
            Some(at) => *at > now,
            None => true,
        });
        Some(before - entries.len())
    }
}

pub fn spawn_sweeper(
    blocklist: Arc<Blocklist>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match blocklist.sweep() {
                        Some(0) => {}
                        Some(n) => log::info!("blocklist sweeper expired {n} entries"),
                        None => log::debug!("blocklist sweep already running, skipping tick"),
                    }
                }
            }
        }
    })
}
