//! Once-per-second cached wall clock for hot paths.
//!
//! Readers try a shared lock and fall back to `SystemTime::now()` when the
//! ticker is updating or has not been started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_secs(1);

struct Clock {
    now: RwLock<SystemTime>,
    running: AtomicBool,
}

fn clock() -> &'static Clock {
    static CLOCK: OnceLock<Clock> = OnceLock::new();
    CLOCK.get_or_init(|| Clock {
        now: RwLock::new(SystemTime::now()),
        running: AtomicBool::new(false),
    })
}

pub fn now() -> SystemTime {
    let clock = clock();
    if !clock.running.load(Ordering::Acquire) {
        return SystemTime::now();
    }
    match clock.now.try_read() {
        Ok(now) => *now,
        Err(_) => SystemTime::now(),
    }
}

pub fn unix_seconds(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Starts the ticker. A second call while one is running is a no-op.
pub fn spawn_ticker(cancel: CancellationToken) -> Option<JoinHandle<()>> {
    let clock = clock();
    if clock.running.swap(true, Ordering::AcqRel) {
        return None;
    }
    if let Ok(mut now) = clock.now.write() {
        *now = SystemTime::now();
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Ok(mut now) = clock.now.write() {
                        *now = SystemTime::now();
                    }
                }
            }
        }
        clock.running.store(false, Ordering::Release);
        log::debug!("clock ticker stopped");
    }))
}
