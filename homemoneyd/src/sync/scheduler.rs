use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::engine::{EngineError, SyncEngine};
use super::network::NetworkStatus;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConstraints {
    pub requires_network: bool,
}

impl Default for ScheduleConstraints {
    fn default() -> Self {
        Self {
            requires_network: true,
        }
    }
}

/// Decides when full sync runs happen.
///
/// A single worker task executes runs, so they never overlap. Every trigger
/// (periodic tick, network restored, one-shot timer, manual) only wakes that
/// worker; wake-ups arriving during a run collapse into one follow-up run.
/// Runs are skipped while the network is unavailable. After a failed run the
/// worker retries on its own with exponential back-off.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    network: watch::Receiver<NetworkStatus>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    runs: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn start(
        engine: Arc<SyncEngine>,
        network: watch::Receiver<NetworkStatus>,
        retry_backoff: Backoff,
    ) -> Self {
        let scheduler = Self {
            engine,
            network,
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            runs: Arc::new(AtomicU64::new(0)),
            tasks: Mutex::new(Vec::new()),
        };
        scheduler.track(scheduler.spawn_worker(retry_backoff));
        scheduler.track(scheduler.spawn_network_trigger());
        scheduler
    }

    pub fn schedule_periodic(&self, interval: Duration, constraints: ScheduleConstraints) {
        let wake = Arc::clone(&self.wake);
        let network = self.network.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if constraints.requires_network && !network.borrow().is_available() {
                    debug!("periodic sync skipped, network unavailable");
                    continue;
                }
                wake.notify_one();
            }
        });
        info!(interval_secs = interval.as_secs(), "periodic sync scheduled");
        self.track(handle);
    }

    pub fn schedule_once(&self, delay: Duration) {
        let wake = Arc::clone(&self.wake);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => wake.notify_one(),
            }
        });
        self.track(handle);
    }

    pub fn trigger_now(&self) {
        self.wake.notify_one();
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops every trigger and the in-flight run, then waits for the tasks.
    pub async fn cancel_all(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduler task ended abnormally");
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn spawn_worker(&self, backoff: Backoff) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let wake = Arc::clone(&self.wake);
        let network = self.network.clone();
        let cancel = self.cancel.clone();
        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut retry_at: Option<Instant> = None;
            loop {
                let retry = async move {
                    match retry_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wake.notified() => {}
                    _ = retry => debug!(failures, "retrying failed sync"),
                }
                retry_at = None;

                if !network.borrow().is_available() {
                    debug!("sync deferred until the network is available");
                    continue;
                }

                let result = engine.perform_full_sync_with(&cancel).await;
                runs.fetch_add(1, Ordering::SeqCst);
                match result {
                    Ok(_) => failures = 0,
                    Err(EngineError::Cancelled) => break,
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        let delay = backoff.after_failures(failures);
                        warn!(
                            error = %err,
                            failures,
                            retry_in_ms = delay.as_millis() as u64,
                            "sync failed, retry scheduled"
                        );
                        retry_at = Some(Instant::now() + delay);
                    }
                }
            }
        })
    }

    fn spawn_network_trigger(&self) -> JoinHandle<()> {
        let wake = Arc::clone(&self.wake);
        let mut network = self.network.clone();
        let cancel = self.cancel.clone();
        // baseline is the state at start(), not at the first poll of the task
        let mut last = *network.borrow_and_update();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let current = *network.borrow_and_update();
                if !last.is_available() && current.is_available() {
                    info!("network restored, triggering sync");
                    wake.notify_one();
                }
                last = current;
            }
        })
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
