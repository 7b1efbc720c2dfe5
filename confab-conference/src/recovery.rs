//! Connectivity recovery
//!
//! Tracks per-path interruption and the bridge ICE restart schedule. The
//! schedule is an exponential backoff from `backon`; multiplicative jitter
//! is applied on top of each base delay. Peer-to-peer failures are never
//! retried: the conference falls back to the bridge instead.

use crate::session::SessionKind;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use confab_core::config::RecoveryConfig;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Backoff cap; the retry count bounds the schedule, not the delay
const MAX_RESTART_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Base (pre-jitter) delays of one failure streak
pub struct IceRestartSchedule {
    backoff: ExponentialBackoff,
    attempts: u32,
}

impl IceRestartSchedule {
    #[must_use]
    pub fn new(config: &RecoveryConfig) -> Self {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(config.ice_restart_min_delay())
            .with_max_delay(MAX_RESTART_DELAY)
            .with_factor(config.ice_restart_growth_factor)
            .with_max_times(config.max_connection_retries as usize)
            .build();
        Self {
            backoff,
            attempts: 0,
        }
    }

    /// Next restart as `(attempt, base delay)`; `None` once exhausted
    pub fn next_restart(&mut self) -> Option<(u32, Duration)> {
        let delay = self.backoff.next()?;
        self.attempts += 1;
        Some((self.attempts, delay))
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Scale `base` by a random factor in `[1, 1 + jitter]`
#[must_use]
pub fn with_jitter(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    base.mul_f64(1.0 + rand::rng().random_range(0.0..=jitter))
}

/// What to do about a failed ICE connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Restart ICE on the existing session after `delay`
    Restart { attempt: u32, delay: Duration },
    /// Schedule used up; the failure is fatal
    Exhausted { attempts: u32 },
    /// Drop the peer-to-peer session and use the bridge
    Fallback,
}

#[derive(Default)]
struct PathState {
    interrupted: bool,
    schedule: Option<IceRestartSchedule>,
    timer: Option<JoinHandle<()>>,
}

impl PathState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct RecoveryController {
    config: RecoveryConfig,
    paths: Mutex<HashMap<SessionKind, PathState>>,
    total_restarts: Mutex<u64>,
}

impl RecoveryController {
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            paths: Mutex::new(HashMap::new()),
            total_restarts: Mutex::new(0),
        }
    }

    /// Returns true if the path was not already interrupted
    pub fn on_interrupted(&self, kind: SessionKind) -> bool {
        let mut paths = self.paths.lock();
        let path = paths.entry(kind).or_default();
        let changed = !path.interrupted;
        path.interrupted = true;
        changed
    }

    /// Connected again: clear the interruption and reset the schedule
    ///
    /// Returns true if the path had been interrupted.
    pub fn on_connected(&self, kind: SessionKind) -> bool {
        let mut paths = self.paths.lock();
        let path = paths.entry(kind).or_default();
        path.cancel_timer();
        if path.schedule.take().is_some() {
            debug!(kind = %kind, "ICE restart schedule reset");
        }
        std::mem::replace(&mut path.interrupted, false)
    }

    #[must_use]
    pub fn is_interrupted(&self, kind: SessionKind) -> bool {
        self.paths.lock().get(&kind).is_some_and(|p| p.interrupted)
    }

    /// Decide how to react to an ICE failure on `kind`
    pub fn on_ice_failed(&self, kind: SessionKind) -> RecoveryAction {
        if kind.is_p2p() {
            return RecoveryAction::Fallback;
        }

        let mut paths = self.paths.lock();
        let path = paths.entry(kind).or_default();
        path.interrupted = true;
        path.cancel_timer();
        let schedule = path
            .schedule
            .get_or_insert_with(|| IceRestartSchedule::new(&self.config));

        match schedule.next_restart() {
            Some((attempt, base)) => {
                let delay = with_jitter(base, self.config.ice_restart_jitter);
                *self.total_restarts.lock() += 1;
                info!(
                    kind = %kind,
                    attempt,
                    max = self.config.max_connection_retries,
                    delay_ms = delay.as_millis() as u64,
                    "ICE restart scheduled"
                );
                RecoveryAction::Restart { attempt, delay }
            }
            None => RecoveryAction::Exhausted {
                attempts: schedule.attempts(),
            },
        }
    }

    /// Keep the handle of a pending restart so it can be cancelled
    pub fn set_timer(&self, kind: SessionKind, timer: JoinHandle<()>) {
        let mut paths = self.paths.lock();
        let path = paths.entry(kind).or_default();
        path.cancel_timer();
        path.timer = Some(timer);
    }

    /// Called by the restart task when its delay has elapsed
    pub fn timer_fired(&self, kind: SessionKind) {
        if let Some(path) = self.paths.lock().get_mut(&kind) {
            path.timer.take();
        }
    }

    #[must_use]
    pub fn has_pending_restart(&self, kind: SessionKind) -> bool {
        self.paths
            .lock()
            .get(&kind)
            .and_then(|p| p.timer.as_ref())
            .is_some_and(|t| !t.is_finished())
    }

    /// Forget everything about a path whose session is gone
    pub fn reset(&self, kind: SessionKind) {
        if let Some(mut path) = self.paths.lock().remove(&kind) {
            path.cancel_timer();
        }
    }

    pub fn cancel_all(&self) {
        for (_, mut path) in self.paths.lock().drain() {
            path.cancel_timer();
        }
    }

    /// ICE restarts scheduled over the conference lifetime
    #[must_use]
    pub fn total_restarts(&self) -> u64 {
        *self.total_restarts.lock()
    }
}
