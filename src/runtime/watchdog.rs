//! Heartbeat monitoring
//!
//! The runtime loop beats a [`Heartbeat`] while it is responsive. The
//! [`Watchdog`] samples its age; when several consecutive samples find it
//! stale it emits [`CrashSignal::Stalled`], and [`save_on_stall`] writes the
//! latest published snapshot without going through the stuck loop.

use crate::recovery::{CrashSignal, RecoveryBridge, RecoverySnapshot, SnapshotStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Consecutive stale samples before the watchdog fires
pub const STALE_CHECKS: u32 = 3;

/// How often the runtime beats and the watchdog samples
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Shared liveness marker
#[derive(Debug, Clone)]
pub struct Heartbeat {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn beat(&self) {
        self.last_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Time since the last beat
    pub fn age(&self) -> Duration {
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }
}

/// Fires once per stall; re-arms when the heartbeat is fresh again
#[derive(Debug)]
pub struct Watchdog {
    heartbeat: Heartbeat,
    stale_after: Duration,
    strikes: u32,
    fired: bool,
}

impl Watchdog {
    pub fn new(heartbeat: Heartbeat, stale_after: Duration) -> Self {
        Self {
            heartbeat,
            stale_after,
            strikes: 0,
            fired: false,
        }
    }

    /// Record one sample of the heartbeat age
    pub fn check(&mut self, age: Duration) -> Option<CrashSignal> {
        if age <= self.stale_after {
            if self.fired {
                tracing::info!("Heartbeat recovered");
            }
            self.strikes = 0;
            self.fired = false;
            return None;
        }

        self.strikes += 1;
        tracing::debug!(age_ms = age.as_millis(), strikes = self.strikes, "Stale heartbeat");
        if self.strikes >= STALE_CHECKS && !self.fired {
            self.fired = true;
            tracing::warn!(age_ms = age.as_millis(), "Runtime unresponsive");
            return Some(CrashSignal::Stalled);
        }
        None
    }

    /// Sample every [`CHECK_INTERVAL`] until cancelled
    pub async fn run(mut self, signals: mpsc::Sender<CrashSignal>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let age = self.heartbeat.age();
                    if let Some(signal) = self.check(age) {
                        if signals.send(signal).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("Watchdog stopped");
    }
}

/// Persist the most recent snapshot for every signal received. Runs
/// beside the runtime loop so a stalled loop can still be saved.
pub async fn save_on_stall<S: SnapshotStore>(
    mut signals: mpsc::Receiver<CrashSignal>,
    latest: watch::Receiver<RecoverySnapshot>,
    recovery: RecoveryBridge<S>,
) {
    while let Some(signal) = signals.recv().await {
        let snapshot = latest.borrow().clone();
        if let Err(e) = recovery.save(&snapshot, signal).await {
            tracing::error!(error = %e, %signal, "Failed to save recovery snapshot");
        }
    }
}
