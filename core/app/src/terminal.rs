//! The terminal service object handed to the UI.

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tillsync_api::{
    Connectivity, HttpResponse, HttpTransport, NetworkMonitor, ReqwestTransport, RequestPipeline,
    SessionManager,
};
use tillsync_common::{Credential, Error, LocalId, Result};
use tillsync_store::{
    LocalStore, OperationKind, PendingOperation, QueueStats, ReferenceCounts, SyncState, SyncTarget,
};
use tillsync_sync::{
    DeviceIdentity, DrainReport, InvalidationChannel, InvalidationHandler, InvalidationSignal,
    OperationQueue, RealtimeHandle, ReconciliationSync, SyncOutcome, SyncReport, SyncRequest,
    SyncScheduler,
};

use crate::config::TerminalConfig;
use crate::identity::{IdentityCache, Operator};
use crate::operations::TerminalOperation;

/// Result of handing an operation to the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OperationStatus {
    /// Accepted by the server.
    Synced { server_id: Option<String> },
    /// Stored locally; a later drain will submit it.
    QueuedForRetry { local_id: LocalId },
}

/// Snapshot of terminal health for operators.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalStatus {
    pub online: bool,
    pub signed_in: bool,
    pub operator: Option<Operator>,
    pub realtime_connected: bool,
    pub queue: QueueStats,
    pub reference: ReferenceCounts,
}

/// Scheduler request for a relevant invalidation, if any.
///
/// Resyncs are full: the backend sends no tombstones, so only a full
/// replace removes rows deleted remotely.
pub fn resync_for(signal: &InvalidationSignal) -> Option<SyncRequest> {
    signal
        .topic
        .sync_target()
        .map(|target| SyncRequest::Resync { target, full: true })
}

struct Background {
    scheduler: SyncScheduler,
    scheduler_task: JoinHandle<()>,
    probe_task: JoinHandle<()>,
    realtime: RealtimeHandle,
}

/// One terminal: local store, session, pipeline, sync components.
///
/// Construct once at process start and share; there is no global state.
pub struct Terminal {
    config: TerminalConfig,
    identity: DeviceIdentity,
    store: LocalStore,
    transport: Arc<dyn HttpTransport>,
    monitor: NetworkMonitor,
    session: Arc<SessionManager>,
    pipeline: Arc<RequestPipeline>,
    reconciler: Arc<ReconciliationSync>,
    queue: Arc<OperationQueue>,
    channel: InvalidationChannel,
    operators: Arc<IdentityCache>,
    scheduler: Arc<RwLock<Option<SyncScheduler>>>,
    background: Mutex<Option<Background>>,
}

impl Terminal {
    /// Open the terminal's database under `data_dir` and talk to the
    /// configured backend over HTTP.
    pub fn open(config: TerminalConfig, data_dir: &Path) -> Result<Self> {
        let store = LocalStore::open(config.database_path_in(data_dir))?;
        let transport = Arc::new(ReqwestTransport::new(&config.api)?);
        Self::with_parts(config, store, transport, NetworkMonitor::new(true))
    }

    /// Assemble a terminal from explicit parts.
    pub fn with_parts(
        config: TerminalConfig,
        store: LocalStore,
        transport: Arc<dyn HttpTransport>,
        monitor: NetworkMonitor,
    ) -> Result<Self> {
        let identity = config.identity()?;

        let session = Arc::new(SessionManager::new(
            Arc::new(store.clone()),
            Arc::clone(&transport),
            identity.device_id.clone(),
            config.api.refresh_path.clone(),
        ));
        let operators = Arc::new(IdentityCache::new(store.clone()));
        session.on_teardown(operators.clone());

        let pipeline = Arc::new(RequestPipeline::new(
            Arc::clone(&transport),
            Arc::clone(&session),
            Arc::new(monitor.clone()),
            identity.device_id.clone(),
        ));
        let reconciler = Arc::new(ReconciliationSync::new(
            Arc::clone(&pipeline),
            store.clone(),
            config.sync_retry.clone(),
        ));
        let queue = Arc::new(OperationQueue::new(
            store.clone(),
            Arc::clone(&pipeline),
            config.retention_days,
        ));

        let channel = InvalidationChannel::new(config.realtime.clone());
        let scheduler: Arc<RwLock<Option<SyncScheduler>>> = Arc::new(RwLock::new(None));
        let slot = Arc::clone(&scheduler);
        channel.on_invalidation(Arc::new(move |signal: &InvalidationSignal| {
            let Some(request) = resync_for(signal) else {
                return;
            };
            if let Ok(current) = slot.read() {
                if let Some(scheduler) = current.as_ref() {
                    scheduler.trigger(request);
                }
            }
        }));

        info!(
            "Terminal {} ready (branch {}, tenant {})",
            identity.device_id, identity.branch_id, identity.tenant_id
        );

        Ok(Self {
            config,
            identity,
            store,
            transport,
            monitor,
            session,
            pipeline,
            reconciler,
            queue,
            channel,
            operators,
            scheduler,
            background: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Store the credential and operator obtained from sign-in.
    pub async fn sign_in(&self, credential: Credential, operator: Option<&Operator>) -> Result<()> {
        self.session.establish(credential).await?;
        if let Some(operator) = operator {
            self.operators.remember(operator).await?;
        }
        Ok(())
    }

    pub async fn operator(&self) -> Result<Option<Operator>> {
        self.operators.current().await
    }

    /// Authenticated `GET`; non-2xx becomes `RemoteRejected`.
    pub async fn get(&self, path: &str) -> Result<HttpResponse> {
        self.pipeline.get(path).await
    }

    /// Authenticated `POST`; non-2xx becomes `RemoteRejected`.
    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<HttpResponse> {
        self.pipeline.post(path, body).await
    }

    /// Persist an operation, then try to submit it right away.
    ///
    /// The operation is durable before any network attempt. When online,
    /// the queue is drained in creation order, so earlier pending
    /// operations go first.
    pub async fn enqueue_operation(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<OperationStatus> {
        let op = self.queue.enqueue(kind, payload).await?;
        let queued = OperationStatus::QueuedForRetry {
            local_id: op.local_id,
        };

        if !self.monitor.is_online() {
            debug!("Offline; {} stays queued", op.local_id);
            return Ok(queued);
        }

        self.queue.drain().await?;

        match self.queue.operation(op.local_id).await? {
            Some(stored) if stored.sync_state == SyncState::Synced => Ok(OperationStatus::Synced {
                server_id: stored.server_id,
            }),
            _ => Ok(queued),
        }
    }

    /// Typed form of [`enqueue_operation`](Self::enqueue_operation).
    pub async fn submit(&self, operation: TerminalOperation) -> Result<OperationStatus> {
        self.enqueue_operation(operation.kind(), operation.payload())
            .await
    }

    /// Submit pending operations now.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.queue.drain().await
    }

    pub async fn purge(&self) -> Result<usize> {
        self.queue.purge().await
    }

    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.queue.pending().await
    }

    /// Reconcile reference data for this terminal's tenant.
    pub async fn sync_now(&self, target: SyncTarget, full: bool) -> Result<SyncReport> {
        self.reconciler
            .sync(&self.identity.tenant_id, target, full)
            .await
    }

    /// Register a handler for relevant invalidation signals.
    pub fn on_invalidation(&self, handler: InvalidationHandler) {
        self.channel.on_invalidation(handler);
    }

    /// Probe reachability once and record the result.
    pub async fn probe_connectivity(&self) -> bool {
        self.monitor
            .probe(self.transport.as_ref(), &self.config.health_path)
            .await
    }

    pub async fn status(&self) -> Result<TerminalStatus> {
        let realtime_connected = self
            .background
            .lock()
            .await
            .as_ref()
            .is_some_and(|background| background.realtime.is_connected());

        Ok(TerminalStatus {
            online: self.monitor.is_online(),
            signed_in: self.session.has_credential().await?,
            operator: self.operators.current().await?,
            realtime_connected,
            queue: self.queue.stats().await?,
            reference: self.store.reference_counts(&self.identity.tenant_id).await?,
        })
    }

    /// Start the scheduler, reachability probe and realtime channel.
    ///
    /// # Errors
    /// - `InvalidInput` when already running
    pub async fn start_background(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Err(Error::InvalidInput(
                "Background tasks already running".to_string(),
            ));
        }

        let (scheduler, handle) = SyncScheduler::new(self.config.scheduler.clone());

        let queue = Arc::clone(&self.queue);
        let reconciler = Arc::clone(&self.reconciler);
        let tenant = self.identity.tenant_id.clone();
        let monitor = self.monitor.clone();
        let work = move |request: SyncRequest| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            let tenant = tenant.clone();
            let online = monitor.is_online();
            async move {
                match request {
                    SyncRequest::Drain if !online => Err(Error::Offline),
                    SyncRequest::Drain => queue.drain().await.map(SyncOutcome::Drained),
                    SyncRequest::Resync { target, full } => reconciler
                        .sync(&tenant, target, full)
                        .await
                        .map(SyncOutcome::Resynced),
                    SyncRequest::Purge => queue.purge().await.map(SyncOutcome::Purged),
                    SyncRequest::Shutdown => Ok(SyncOutcome::Stopped),
                }
            }
        };
        let scheduler_task = tokio::spawn(handle.run(work, Some(self.monitor.subscribe())));

        let probe_task = {
            let monitor = self.monitor.clone();
            let transport = Arc::clone(&self.transport);
            let path = self.config.health_path.clone();
            let period = Duration::from_secs(self.config.probe_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    monitor.probe(transport.as_ref(), &path).await;
                }
            })
        };

        let realtime = self.channel.connect(self.identity.clone());

        match self.scheduler.write() {
            Ok(mut slot) => *slot = Some(scheduler.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(scheduler.clone()),
        }

        *background = Some(Background {
            scheduler,
            scheduler_task,
            probe_task,
            realtime,
        });
        info!("Background sync started");
        Ok(())
    }

    /// Stop background tasks, if running.
    pub async fn shutdown(&self) {
        let Some(background) = self.background.lock().await.take() else {
            return;
        };

        match self.scheduler.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }

        background.probe_task.abort();
        background.realtime.shutdown().await;
        background.scheduler.shutdown().await;
        if let Err(e) = background.scheduler_task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        info!("Background sync stopped");
    }
}
