//! Durable queue of state-changing operations, replayed in creation order.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tillsync_api::RequestPipeline;
use tillsync_common::{Error, LocalId, Result};
use tillsync_store::{LocalStore, NewOperation, OperationKind, PendingOperation, QueueStats};

/// Default retention for synced operations.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Remote endpoint an operation kind is submitted to.
pub fn endpoint_for(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::OpenShift => "/shifts/open",
        OperationKind::CloseShift => "/shifts/close",
        OperationKind::OpenTill => "/tills/open",
        OperationKind::CloseTill => "/tills/close",
        OperationKind::CreateOrder => "/orders",
        OperationKind::CloseOrder => "/orders/close",
        OperationKind::VoidOrder => "/orders/void",
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Operations that reached `Synced` in this pass.
    pub synced: usize,
    /// Operations still pending afterwards.
    pub remaining: u64,
    /// The operation the pass stopped at, if any failed.
    pub stopped_at: Option<LocalId>,
    pub error: Option<String>,
}

/// Offline operation queue.
///
/// Drains are serialized: a second caller waits for the running pass and
/// then starts from the remaining pending rows, so no operation is ever
/// submitted twice concurrently.
pub struct OperationQueue {
    store: LocalStore,
    pipeline: Arc<RequestPipeline>,
    drain_lock: Mutex<()>,
    retention: chrono::Duration,
}

impl OperationQueue {
    pub fn new(store: LocalStore, pipeline: Arc<RequestPipeline>, retention_days: i64) -> Self {
        Self {
            store,
            pipeline,
            drain_lock: Mutex::new(()),
            retention: chrono::Duration::days(retention_days),
        }
    }

    /// Persist an operation before any network attempt.
    ///
    /// # Errors
    /// - `InvalidInput` when `payload` is not a JSON object
    pub async fn enqueue(&self, kind: OperationKind, payload: Value) -> Result<PendingOperation> {
        if !payload.is_object() {
            return Err(Error::InvalidInput(format!(
                "{} payload must be a JSON object",
                kind
            )));
        }

        let op = self.store.insert_operation(NewOperation::new(kind, payload)).await?;
        info!("Queued {} operation {}", op.kind, op.local_id);
        Ok(op)
    }

    /// Submit pending operations in creation order, stopping at the first
    /// failure. The failed operation stays pending for the next pass.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        let pending = self.store.pending_operations().await?;
        if !pending.is_empty() {
            debug!("Draining {} pending operations", pending.len());
        }

        for op in pending {
            match self.submit(&op).await {
                Ok(server_id) => {
                    self.store
                        .mark_operation_synced(op.local_id, server_id.clone())
                        .await?;
                    debug!(
                        "Synced {} {} (server id {:?})",
                        op.kind, op.local_id, server_id
                    );
                    report.synced += 1;
                }
                Err(e) => {
                    if !matches!(e, Error::Offline) {
                        self.store
                            .record_operation_failure(op.local_id, &e.to_string())
                            .await?;
                    }
                    warn!(
                        "Submitting {} {} failed (attempt {}): {}",
                        op.kind,
                        op.local_id,
                        op.attempts + 1,
                        e
                    );
                    report.stopped_at = Some(op.local_id);
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        report.remaining = self.store.queue_stats().await?.pending;
        if report.synced > 0 {
            info!(
                "Drained {} operations, {} remaining",
                report.synced, report.remaining
            );
        }
        Ok(report)
    }

    /// Delete synced operations older than the retention horizon.
    pub async fn purge(&self) -> Result<usize> {
        let purged = self
            .store
            .purge_synced_before(Utc::now() - self.retention)
            .await?;
        if purged > 0 {
            info!("Purged {} synced operations", purged);
        }
        Ok(purged)
    }

    pub async fn pending(&self) -> Result<Vec<PendingOperation>> {
        self.store.pending_operations().await
    }

    pub async fn operation(&self, local_id: LocalId) -> Result<Option<PendingOperation>> {
        self.store.operation(local_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.queue_stats().await
    }

    async fn submit(&self, op: &PendingOperation) -> Result<Option<String>> {
        let mut body = op.payload.clone();
        if let Some(fields) = body.as_object_mut() {
            fields.insert("localId".to_string(), Value::String(op.local_id.to_string()));
        }

        let response = self
            .pipeline
            .post_idempotent(endpoint_for(op.kind), body, op.local_id)
            .await?;
        Ok(server_id_from(&response.body))
    }
}

/// Server-assigned id from a submission response: `id`, `serverId`, or
/// `data.id`.
fn server_id_from(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;

    let id = value
        .get("id")
        .or_else(|| value.get("serverId"))
        .or_else(|| value.get("data").and_then(|data| data.get("id")))?;

    match id {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
