//! Heartbeats in both directions.
//!
//! The server pings every connection on a fixed interval and drops any that
//! failed to pong since the previous sweep. The client arms a [`Watchdog`]
//! that fires if no server ping arrives within its timeout.

use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Result of one heartbeat sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Connections that were pinged
    pub probed: usize,
    /// Connections dropped for missing the previous probe
    pub terminated: Vec<String>,
}

/// Probe every open session once.
///
/// A session still flagged not-alive from the last sweep is terminated;
/// every other session has its flag cleared and is pinged.
pub fn sweep(sessions: &[Arc<Session>]) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();

    for session in sessions {
        if session.is_closed() {
            continue;
        }
        if !session.take_alive() {
            warn!("connection {} missed heartbeat, terminating", session.id());
            session.terminate();
            outcome.terminated.push(session.id().to_string());
            continue;
        }
        if session.ping() {
            outcome.probed += 1;
        }
    }

    outcome
}

/// Run [`sweep`] over `snapshot()` every `interval` until aborted.
pub(crate) async fn run_heartbeat<F>(interval: Duration, snapshot: F)
where
    F: Fn() -> Vec<Arc<Session>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let outcome = sweep(&snapshot());
        debug!(
            "heartbeat sweep: {} probed, {} terminated",
            outcome.probed,
            outcome.terminated.len()
        );
    }
}

/// Fires a callback when not reset within its timeout.
#[derive(Debug)]
pub struct Watchdog {
    reset: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Watchdog {
    /// Arm a watchdog; `on_expire` runs at most once.
    pub fn spawn<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let reset = Arc::new(Notify::new());
        let task = tokio::spawn({
            let reset = Arc::clone(&reset);
            async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(timeout) => {
                            on_expire();
                            return;
                        }
                        _ = reset.notified() => {}
                    }
                }
            }
        });

        Self { reset, task }
    }

    /// Push the deadline out by a full timeout.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}
