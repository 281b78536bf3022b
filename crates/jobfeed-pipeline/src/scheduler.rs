//! Periodic refresh scheduler with pause/resume and a live countdown.
//!
//! The scheduler never runs a refresh itself; it emits [`RefreshTrigger`]s on
//! a capacity-1 channel and the consumer drives [`crate::FeedService`]. The
//! countdown is anchored to the runtime clock so it behaves under test-paused
//! time; wall-clock timestamps are derived for display only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::debug;

use crate::RefreshConfig;

/// One requested refresh. `manual` distinguishes user-initiated triggers from
/// interval fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTrigger {
    pub requested_at: DateTime<Utc>,
    pub manual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub is_refreshing: bool,
    pub is_paused: bool,
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_refresh_time: Option<DateTime<Utc>>,
    pub next_refresh_time: Option<DateTime<Utc>>,
    pub seconds_until_refresh: Option<u64>,
}

struct SchedulerInner {
    config: RefreshConfig,
    paused: bool,
    deadline: Option<Instant>,
    last_refresh_time: Option<DateTime<Utc>>,
    // Bumped on every re-arm; a tick task exits when its generation is stale.
    generation: u64,
}

pub struct RefreshScheduler {
    refreshing: Arc<AtomicBool>,
    trigger_tx: mpsc::Sender<RefreshTrigger>,
    inner: Mutex<SchedulerInner>,
}

impl RefreshScheduler {
    /// `refreshing` is the feed's in-flight guard; triggers are suppressed
    /// while it is set. The returned receiver holds at most one pending
    /// trigger, so overlapping fires coalesce.
    pub fn new(
        refreshing: Arc<AtomicBool>,
        config: RefreshConfig,
    ) -> (Arc<Self>, mpsc::Receiver<RefreshTrigger>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let scheduler = Arc::new(Self {
            refreshing,
            trigger_tx,
            inner: Mutex::new(SchedulerInner {
                config,
                paused: false,
                deadline: None,
                last_refresh_time: None,
                generation: 0,
            }),
        });
        scheduler.arm();
        (scheduler, trigger_rx)
    }

    /// Restart the interval from now, or clear it when refreshes are
    /// disabled. Any previously spawned tick task is retired by generation.
    fn arm(self: &Arc<Self>) {
        let (generation, deadline, period) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.generation += 1;
            if !inner.config.enabled {
                inner.deadline = None;
                return;
            }
            let period = Duration::from_secs(inner.config.interval_minutes.max(1) * 60);
            let deadline = Instant::now() + period;
            inner.deadline = Some(deadline);
            (inner.generation, deadline, period)
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(deadline, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let fired_at = ticker.tick().await;
                let paused = {
                    let mut inner = this.inner.lock().unwrap_or_else(|e| e.into_inner());
                    if inner.generation != generation {
                        return;
                    }
                    inner.deadline = Some(fired_at + period);
                    inner.paused
                };
                if paused {
                    debug!("scheduled refresh suppressed while paused");
                    continue;
                }
                this.fire(false);
            }
        });
    }

    fn fire(&self, manual: bool) -> bool {
        if self.refreshing.load(Ordering::SeqCst) {
            debug!(manual, "refresh already in flight, trigger dropped");
            return false;
        }
        let trigger = RefreshTrigger {
            requested_at: Utc::now(),
            manual,
        };
        match self.trigger_tx.try_send(trigger) {
            Ok(()) => true,
            Err(_) => {
                debug!(manual, "a trigger is already pending");
                false
            }
        }
    }

    /// Bypasses pause, but still respects the in-flight guard and coalesces
    /// with any pending trigger. Returns whether a trigger was emitted.
    pub fn request_manual_refresh(&self) -> bool {
        self.fire(true)
    }

    /// Keep the interval ticking but suppress fires.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.paused = true;
    }

    /// Unpause and restart the countdown from now; time spent paused does
    /// not count toward the next fire.
    pub fn resume(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.paused {
                return;
            }
            inner.paused = false;
        }
        self.arm();
    }

    /// Returns the new paused state.
    pub fn toggle_pause(self: &Arc<Self>) -> bool {
        let paused = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.paused
        };
        if paused {
            self.resume();
            false
        } else {
            self.pause();
            true
        }
    }

    /// Apply a new config and re-arm (or clear, when disabled).
    pub fn set_config(self: &Arc<Self>, config: RefreshConfig) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.config = config;
        }
        self.arm();
    }

    pub fn config(&self) -> RefreshConfig {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.config.clone()
    }

    /// Record when a refresh finished, for status display.
    pub fn record_refresh(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_refresh_time = Some(at);
    }

    /// Retire the tick task and clear the countdown.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.generation += 1;
        inner.deadline = None;
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let seconds_until_refresh = inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs());
        let next_refresh_time = seconds_until_refresh
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64));
        SchedulerStatus {
            is_refreshing: self.refreshing.load(Ordering::SeqCst),
            is_paused: inner.paused,
            enabled: inner.config.enabled,
            interval_minutes: inner.config.interval_minutes,
            last_refresh_time: inner.last_refresh_time,
            next_refresh_time,
            seconds_until_refresh,
        }
    }
}
