//! Ping/pong liveness tracking for socket transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Shortest ping interval used by the transport. Shorter intervals,
/// including zero, are raised to this.
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Activity flag shared between a connection's reader and its heartbeat.
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl Liveness {
    /// Starts out alive.
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Record a pong or any inbound frame.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Read and reset the flag. `true` if there was activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client went quiet for longer than the timeout.
    TimedOut,
    /// The connection ended first.
    Cancelled,
}

/// Watch a connection's liveness until it times out or `cancel` fires.
///
/// Each `interval` tick checks and resets the activity flag. After
/// `timeout / interval` consecutive quiet ticks (at least one) the
/// connection is declared dead. `interval` is raised to [`MIN_PING_INTERVAL`].
pub async fn run_heartbeat(
    liveness: &Liveness,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let interval = interval.max(MIN_PING_INTERVAL);
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let interval_ms = interval.as_millis().max(1);
    let max_missed = (timeout.as_millis() / interval_ms).max(1);
    let mut missed: u128 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if liveness.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
