use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// State of one runtime parameter.
///
/// While a candidate is deploying, each read returns it with probability
/// `(steps - step) / steps`; `step` counts down once per tick and the
/// candidate becomes current when it reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot<T> {
    pub current: T,
    pub candidate: Option<T>,
    pub step: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    Stepped,
    Committed,
    Stale,
}

struct State<T> {
    current: T,
    candidate: Option<T>,
    step: u32,
    generation: u64,
}

struct Deployment {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Entry<T> {
    name: &'static str,
    steps: u32,
    tick: Duration,
    state: Mutex<State<T>>,
    deployment: Mutex<Option<Deployment>>,
    deploy_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl<T> Entry<T>
where
    T: Copy + PartialEq + Debug + Send + Sync + 'static,
{
    pub fn new(name: &'static str, value: T, steps: u32, tick: Duration, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            name,
            steps,
            tick,
            state: Mutex::new(State {
                current: value,
                candidate: None,
                step: 0,
                generation: 0,
            }),
            deployment: Mutex::new(None),
            deploy_lock: tokio::sync::Mutex::new(()),
            cancel,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> T {
        self.get_with(&mut rand::thread_rng())
    }

    pub fn get_with<R: Rng + ?Sized>(&self, rng: &mut R) -> T {
        let state = self.lock_state();
        match state.candidate {
            None => state.current,
            Some(candidate) => {
                let draw = rng.gen_range(1..=self.steps);
                if draw <= self.steps - state.step {
                    candidate
                } else {
                    state.current
                }
            }
        }
    }

    /// The committed value, ignoring any deploy in flight.
    pub fn current(&self) -> T {
        self.lock_state().current
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        let state = self.lock_state();
        Snapshot {
            current: state.current,
            candidate: state.candidate,
            step: state.step,
        }
    }

    pub fn is_deploying(&self) -> bool {
        self.lock_state().candidate.is_some()
    }

    /// Replaces the value at once, abandoning any deploy in flight.
    pub fn set(&self, value: T) {
        {
            let mut state = self.lock_state();
            state.current = value;
            state.candidate = None;
            state.step = 0;
            state.generation += 1;
        }
        if let Some(deployment) = self.take_deployment() {
            deployment.cancel.cancel();
        }
        log::info!("runtime {} set to {:?}", self.name, value);
    }

    /// Moves towards `value` over the configured number of ticks.
    ///
    /// A deploy already in flight is cancelled and awaited first. Asking for
    /// the committed value cancels the deploy; asking for the deploying
    /// candidate changes nothing.
    pub async fn set_smoothly(self: &Arc<Self>, value: T) {
        let _serial = self.deploy_lock.lock().await;

        {
            let state = self.lock_state();
            if state.candidate == Some(value) {
                return;
            }
            if state.candidate.is_none() && state.current == value {
                return;
            }
        }

        if let Some(previous) = self.take_deployment() {
            previous.cancel.cancel();
            if let Err(err) = previous.handle.await {
                log::warn!("runtime {} previous deploy ended abnormally: {err}", self.name);
            }
        }

        let generation = {
            let mut state = self.lock_state();
            state.generation += 1;
            if state.current == value {
                state.candidate = None;
                state.step = 0;
                log::info!("runtime {} deploy cancelled, staying at {:?}", self.name, value);
                return;
            }
            if self.steps == 0 {
                state.current = value;
                state.candidate = None;
                state.step = 0;
                log::info!("runtime {} set to {:?}", self.name, value);
                return;
            }
            state.candidate = Some(value);
            state.step = self.steps;
            log::info!(
                "runtime {} deploying {:?} -> {:?} over {} steps of {:?}",
                self.name,
                state.current,
                value,
                self.steps,
                self.tick
            );
            state.generation
        };

        let cancel = self.cancel.child_token();
        let entry = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + entry.tick;
            let mut ticker = tokio::time::interval_at(start, entry.tick);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if entry.advance_generation(generation) != Advance::Stepped {
                            break;
                        }
                    }
                }
            }
        });

        let mut slot = self.deployment.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Deployment { cancel, handle });
    }

    /// Moves the deploy in flight one step. Returns true when it committed.
    pub fn advance(&self) -> bool {
        let generation = self.lock_state().generation;
        self.advance_generation(generation) == Advance::Committed
    }

    fn advance_generation(&self, generation: u64) -> Advance {
        let mut state = self.lock_state();
        if state.generation != generation {
            return Advance::Stale;
        }
        let Some(candidate) = state.candidate else {
            return Advance::Stale;
        };
        state.step = state.step.saturating_sub(1);
        if state.step > 0 {
            log::debug!("runtime {} deploy step {} left", self.name, state.step);
            return Advance::Stepped;
        }
        state.current = candidate;
        state.candidate = None;
        log::info!("runtime {} committed {:?}", self.name, candidate);
        Advance::Committed
    }

    fn take_deployment(&self) -> Option<Deployment> {
        self.deployment.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
