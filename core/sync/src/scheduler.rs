//! Background scheduling of drains and resyncs.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use tillsync_common::{Error, Result};
use tillsync_store::SyncTarget;

use crate::queue::DrainReport;
use crate::reconcile::SyncReport;

/// Work the scheduler serializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Replay pending operations.
    Drain,
    /// Reconcile reference data.
    Resync { target: SyncTarget, full: bool },
    /// Delete synced operations past retention.
    Purge,
    /// Stop the scheduler.
    Shutdown,
}

/// Result of one unit of work.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Drained(DrainReport),
    Resynced(SyncReport),
    Purged(usize),
    Stopped,
}

/// Periodic timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between periodic drains.
    pub drain_interval_secs: u64,
    /// Seconds between full reference syncs and retention purges.
    pub reference_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: 30,
            reference_interval_secs: 15 * 60,
        }
    }
}

type Envelope = (SyncRequest, Option<oneshot::Sender<Result<SyncOutcome>>>);

/// Cloneable front end for submitting work to the scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new(config: SchedulerConfig) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        (
            Self { request_tx },
            SyncSchedulerHandle { config, request_rx },
        )
    }

    /// Submit work and wait for its outcome.
    pub async fn request(&self, request: SyncRequest) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, Some(response_tx)))
            .await
            .map_err(|_| Error::Config("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Config("Scheduler stopped before responding".to_string()))?
    }

    /// Submit work without waiting. Returns `false` when the queue is full
    /// or the scheduler has stopped.
    pub fn trigger(&self, request: SyncRequest) -> bool {
        match self.request_tx.try_send((request, None)) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping scheduler request: {}", e);
                false
            }
        }
    }

    /// Stop the scheduler after the current unit of work.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// Owns the receiving side; consumed by [`SyncSchedulerHandle::run`].
pub struct SyncSchedulerHandle {
    config: SchedulerConfig,
    request_rx: mpsc::Receiver<Envelope>,
}

impl SyncSchedulerHandle {
    /// Run until shutdown. Spawn this in a tokio task.
    ///
    /// `work` handles one request at a time, so drains and resyncs never
    /// overlap. Besides explicit requests, the loop drains on a timer and
    /// whenever `connectivity` flips to online, and fully resyncs reference
    /// data on a slower timer.
    pub async fn run<F, Fut>(mut self, work: F, connectivity: Option<watch::Receiver<bool>>)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncOutcome>> + Send,
    {
        let mut drain_timer = interval(Duration::from_secs(self.config.drain_interval_secs.max(1)));
        drain_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reference_timer =
            interval(Duration::from_secs(self.config.reference_interval_secs.max(1)));
        reference_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connectivity = connectivity;

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                received = self.request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All scheduler senders dropped");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        if let Some(tx) = response_tx {
                            let _ = tx.send(Ok(SyncOutcome::Stopped));
                        }
                        break;
                    }

                    debug!("Processing {:?}", request);
                    let result = work(request).await;
                    match response_tx {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => log_outcome("Requested", &result),
                    }
                }

                _ = drain_timer.tick() => {
                    let result = work(SyncRequest::Drain).await;
                    log_outcome("Periodic", &result);
                }

                _ = reference_timer.tick() => {
                    let result = work(SyncRequest::Resync { target: SyncTarget::All, full: true }).await;
                    log_outcome("Periodic", &result);
                    let result = work(SyncRequest::Purge).await;
                    log_outcome("Periodic", &result);
                }

                online = wait_until_online(&mut connectivity) => {
                    if online {
                        info!("Connectivity restored; draining queue");
                        let result = work(SyncRequest::Drain).await;
                        log_outcome("Reconnect", &result);
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }
}

/// Resolves on the next connectivity change with the new state. Never
/// resolves without a receiver, or once the sender is gone.
async fn wait_until_online(connectivity: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(rx) = connectivity.as_mut() else {
        return std::future::pending().await;
    };

    if rx.changed().await.is_err() {
        *connectivity = None;
        return false;
    }
    *rx.borrow_and_update()
}

fn log_outcome(origin: &str, result: &Result<SyncOutcome>) {
    match result {
        Ok(SyncOutcome::Drained(report)) if report.synced > 0 || report.error.is_some() => {
            info!(
                "{} drain: {} synced, {} remaining",
                origin, report.synced, report.remaining
            );
        }
        Ok(SyncOutcome::Resynced(report)) => {
            info!(
                "{} resync of {}: {} rows",
                origin,
                report.target,
                report.rows_written()
            );
        }
        Ok(_) => {}
        Err(Error::Offline) => debug!("{} sync skipped: offline", origin),
        Err(e) => error!("{} sync failed: {}", origin, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (
        Arc<Mutex<Vec<SyncRequest>>>,
        impl Fn(SyncRequest) -> futures::future::Ready<Result<SyncOutcome>> + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let work = move |request: SyncRequest| {
            sink.lock().unwrap().push(request);
            futures::future::ready(Ok(SyncOutcome::Purged(0)))
        };
        (seen, work)
    }

    fn slow_timers() -> SchedulerConfig {
        SchedulerConfig {
            drain_interval_secs: 3600,
            reference_interval_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_request_returns_outcome() {
        let (scheduler, handle) = SyncScheduler::new(slow_timers());
        let (seen, work) = recorder();
        let task = tokio::spawn(handle.run(work, None));

        let outcome = scheduler.request(SyncRequest::Purge).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Purged(0)));
        assert!(seen.lock().unwrap().contains(&SyncRequest::Purge));

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(scheduler.request(SyncRequest::Drain).await.is_err());
    }

    #[tokio::test]
    async fn test_startup_runs_drain_and_resync() {
        let (scheduler, handle) = SyncScheduler::new(slow_timers());
        let (seen, work) = recorder();
        let task = tokio::spawn(handle.run(work, None));

        // Interval timers fire immediately on start.
        scheduler.request(SyncRequest::Purge).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen = seen.lock().unwrap().clone();
        assert!(seen.contains(&SyncRequest::Drain));
        assert!(seen.contains(&SyncRequest::Resync {
            target: SyncTarget::All,
            full: true
        }));

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connectivity_restored_triggers_drain() {
        let (scheduler, handle) = SyncScheduler::new(slow_timers());
        let (seen, work) = recorder();
        let (online_tx, online_rx) = watch::channel(false);
        let task = tokio::spawn(handle.run(work, Some(online_rx)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let drains_before = count_drains(&seen);

        online_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count_drains(&seen), drains_before + 1);

        online_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count_drains(&seen), drains_before + 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_is_fire_and_forget() {
        let (scheduler, handle) = SyncScheduler::new(slow_timers());
        let (seen, work) = recorder();
        let task = tokio::spawn(handle.run(work, None));

        let resync = SyncRequest::Resync {
            target: SyncTarget::Pricing,
            full: false,
        };
        assert!(scheduler.trigger(resync.clone()));
        scheduler.request(SyncRequest::Purge).await.unwrap();
        assert!(seen.lock().unwrap().contains(&resync));

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(!scheduler.trigger(SyncRequest::Drain));
    }

    fn count_drains(seen: &Arc<Mutex<Vec<SyncRequest>>>) -> usize {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|r| **r == SyncRequest::Drain)
            .count()
    }
}
