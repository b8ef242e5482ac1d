//! Liveness state machine for the sleeper host.
//!
//! The waker keeps one instance of [`SleeperStateMachine`] as its only
//! source of truth about whether the sleeper is up. HTTP handlers feed it
//! wake/suspend/heartbeat events and a background loop drives the
//! timer-based transitions. Every operation is total: any event is valid
//! in any state, possibly as a no-op.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CommonConf;

/// Monotonic time source, injectable so that timer boundaries can be
/// tested deterministically.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed epoch.
    fn now(&self) -> Duration;
}

pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SleeperState {
    /// No heartbeats. Sleeper is asleep.
    Off,
    /// Wake signal sent. Waiting for the first heartbeat.
    Waking,
    /// Heartbeats flowing. Sleeper confirmed alive.
    On,
    /// Wake signal sent, wake_timeout elapsed with no heartbeat.
    Failed,
}

impl SleeperState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SleeperState::Off => "OFF",
            SleeperState::Waking => "WAKING",
            SleeperState::On => "ON",
            SleeperState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SleeperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of the liveness record, for status endpoints.
/// Timestamps are offsets on the machine's monotonic clock.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub state: SleeperState,
    pub last_heartbeat_at: Option<Duration>,
    pub wake_requested_at: Option<Duration>,
    pub suspend_requested_at: Option<Duration>,
}

#[derive(Debug)]
struct LivenessRecord {
    state: SleeperState,
    last_heartbeat_at: Option<Duration>,
    wake_requested_at: Option<Duration>,
    suspend_requested_at: Option<Duration>,
}

/// Tracks whether the sleeper machine is on, off, waking, or failed.
///
/// Thread-safe: every public method acquires the one internal lock for
/// its whole critical section, and none of them performs I/O while
/// holding it.
pub struct SleeperStateMachine {
    wake_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_miss_threshold: u32,
    clock: Box<dyn Clock>,
    record: Mutex<LivenessRecord>,
}

impl SleeperStateMachine {
    pub fn new(
        wake_timeout: Duration,
        heartbeat_interval: Duration,
        heartbeat_miss_threshold: u32,
    ) -> Self {
        Self::with_clock(
            wake_timeout,
            heartbeat_interval,
            heartbeat_miss_threshold,
            Box::new(MonotonicClock::new()),
        )
    }

    pub fn with_clock(
        wake_timeout: Duration,
        heartbeat_interval: Duration,
        heartbeat_miss_threshold: u32,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            wake_timeout,
            heartbeat_interval,
            heartbeat_miss_threshold,
            clock,
            record: Mutex::new(LivenessRecord {
                state: SleeperState::Off,
                last_heartbeat_at: None,
                wake_requested_at: None,
                suspend_requested_at: None,
            }),
        }
    }

    pub fn from_config(common: &CommonConf) -> Self {
        Self::new(
            duration_or(common.wake_timeout, 120.0),
            duration_or(common.heartbeat_interval, 60.0),
            common.heartbeat_miss_threshold,
        )
    }

    /// Transition: wake command issued (WoL packet sent).
    ///
    /// Also clears the suspend-inhibit marker: an operator asking for a
    /// wake wants the next heartbeat honored.
    pub fn wake_requested(&self) -> SleeperState {
        let now = self.clock.now();
        let mut rec = self.record.lock();
        rec.suspend_requested_at = None;
        match rec.state {
            SleeperState::Off | SleeperState::Failed => {
                info!("state: {} -> WAKING (wake requested)", rec.state);
                rec.state = SleeperState::Waking;
                rec.wake_requested_at = Some(now);
            }
            SleeperState::Waking => {
                info!("state: WAKING -> WAKING (retry, resetting timer)");
                rec.wake_requested_at = Some(now);
            }
            SleeperState::On => {
                info!("state: ON (wake requested, already on)");
            }
        }
        rec.state
    }

    /// Record suspend intent. The state itself only changes later, via
    /// missed heartbeats; meanwhile stale in-flight heartbeats are
    /// inhibited for `2 * heartbeat_interval`.
    pub fn suspend_requested(&self) -> SleeperState {
        let now = self.clock.now();
        let mut rec = self.record.lock();
        info!(
            "suspend requested in state {}, inhibiting heartbeats for {}s",
            rec.state,
            self.inhibit_window().as_secs()
        );
        rec.suspend_requested_at = Some(now);
        rec.state
    }

    /// Process an incoming heartbeat from the sleeper.
    pub fn heartbeat_received(&self) -> SleeperState {
        let now = self.clock.now();
        let mut rec = self.record.lock();

        if let Some(suspended_at) = rec.suspend_requested_at {
            if now.saturating_sub(suspended_at) < self.inhibit_window() {
                debug!(
                    "heartbeat dropped, {}s into the suspend-inhibit window",
                    now.saturating_sub(suspended_at).as_secs()
                );
                return rec.state;
            }
            rec.suspend_requested_at = None;
        }

        rec.last_heartbeat_at = Some(now);
        match rec.state {
            SleeperState::Waking | SleeperState::Off | SleeperState::Failed => {
                info!("state: {} -> ON (heartbeat received)", rec.state);
                rec.state = SleeperState::On;
                rec.wake_requested_at = None;
            }
            SleeperState::On => {
                debug!("state: ON (heartbeat refreshed)");
            }
        }
        rec.state
    }

    /// Timer-based transitions. Called from a background loop every ~10s.
    ///
    /// The wake deadline is inclusive (`>=`), the heartbeat-miss window
    /// is exclusive (strict `>`).
    pub fn check_timeouts(&self) -> SleeperState {
        let now = self.clock.now();
        let mut rec = self.record.lock();

        match rec.state {
            SleeperState::Waking => {
                if let Some(at) = rec.wake_requested_at {
                    if now.saturating_sub(at) >= self.wake_timeout {
                        warn!(
                            "state: WAKING -> FAILED (wake_timeout={}s exceeded)",
                            self.wake_timeout.as_secs()
                        );
                        rec.state = SleeperState::Failed;
                        rec.wake_requested_at = None;
                    }
                }
            }
            SleeperState::On => {
                if let Some(at) = rec.last_heartbeat_at {
                    let window = self.heartbeat_interval * self.heartbeat_miss_threshold;
                    if now.saturating_sub(at) > window {
                        info!(
                            "state: ON -> OFF (no heartbeat for {}s)",
                            now.saturating_sub(at).as_secs()
                        );
                        rec.state = SleeperState::Off;
                        rec.last_heartbeat_at = None;
                    }
                }
            }
            SleeperState::Off | SleeperState::Failed => {}
        }
        rec.state
    }

    pub fn state(&self) -> SleeperState {
        self.record.lock().state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let rec = self.record.lock();
        StateSnapshot {
            state: rec.state,
            last_heartbeat_at: rec.last_heartbeat_at,
            wake_requested_at: rec.wake_requested_at,
            suspend_requested_at: rec.suspend_requested_at,
        }
    }

    /// Current reading of the machine's own clock, so callers can turn
    /// snapshot timestamps into ages.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    fn inhibit_window(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

// Negative or non-finite config values cannot become Durations; fall
// back to the documented default (validation reports the bad value).
fn duration_or(secs: f64, fallback_secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(fallback_secs))
}
