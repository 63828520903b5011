//! Reconciliation of cached reference data with the remote snapshot.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use tillsync_api::{HttpRequest, RequestPipeline};
use tillsync_common::{Result, TenantId};
use tillsync_store::{LocalStore, ReferenceSnapshot, ReferenceTable, SyncTarget};

use crate::retry::{RetryConfig, RetryExecutor};

/// Reference snapshot endpoint.
pub const REFERENCE_PATH: &str = "/sync/reference";

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub target: SyncTarget,
    /// Whether local rows were replaced rather than upserted.
    pub full: bool,
    /// Rows written per table.
    pub written: Vec<(ReferenceTable, usize)>,
    /// Tables left untouched.
    pub skipped: Vec<ReferenceTable>,
    /// The whole snapshot was empty and nothing was applied.
    pub empty: bool,
    pub duration: Duration,
}

impl SyncReport {
    pub fn rows_written(&self) -> usize {
        self.written.iter().map(|(_, n)| n).sum()
    }
}

/// Pulls reference data into the local store.
pub struct ReconciliationSync {
    pipeline: Arc<RequestPipeline>,
    store: LocalStore,
    retry: RetryExecutor,
}

impl ReconciliationSync {
    pub fn new(pipeline: Arc<RequestPipeline>, store: LocalStore, retry: RetryConfig) -> Self {
        Self {
            pipeline,
            store,
            retry: RetryExecutor::new(retry),
        }
    }

    /// Reconcile `target` for `tenant`.
    ///
    /// A full sync replaces the tenant's rows of every table in `target`; an
    /// incremental sync requests changes since the stored cursor and upserts
    /// them. With no stored cursor an incremental request runs as a full
    /// sync. A snapshot with no rows at all leaves the cache untouched.
    ///
    /// # Errors
    /// Fetch or parse failures leave the store exactly as it was.
    pub async fn sync(&self, tenant: &TenantId, target: SyncTarget, full: bool) -> Result<SyncReport> {
        let start = Instant::now();

        let cursor = if full {
            None
        } else {
            let cursor = self.store.sync_cursor(tenant, target).await?;
            if cursor.is_none() {
                info!("No sync cursor for {}; running full sync", target);
            }
            cursor
        };
        let full = cursor.is_none();

        let snapshot = self.fetch(tenant, target, cursor.as_deref()).await?;

        if snapshot.is_empty_for(target) {
            info!(
                "Reference snapshot for {} is empty; keeping cached data",
                target
            );
            return Ok(SyncReport {
                target,
                full,
                written: Vec::new(),
                skipped: target.tables().to_vec(),
                empty: true,
                duration: start.elapsed(),
            });
        }

        let stats = if full {
            self.store.replace_reference(tenant, target, snapshot).await?
        } else {
            self.store.upsert_reference(tenant, target, snapshot).await?
        };

        let report = SyncReport {
            target,
            full,
            written: stats.written,
            skipped: stats.skipped,
            empty: false,
            duration: start.elapsed(),
        };
        info!(
            "Reference sync ({}, {}) wrote {} rows in {:?}",
            target,
            if full { "full" } else { "incremental" },
            report.rows_written(),
            report.duration
        );
        Ok(report)
    }

    async fn fetch(
        &self,
        tenant: &TenantId,
        target: SyncTarget,
        since: Option<&str>,
    ) -> Result<ReferenceSnapshot> {
        let mut request = HttpRequest::get(REFERENCE_PATH)
            .query("tenantId", tenant.as_str())
            .query("target", target.as_str());
        if let Some(since) = since {
            request = request.query("since", since);
        }

        let pipeline = &self.pipeline;
        self.retry
            .execute(|| {
                let request = request.clone();
                async move { pipeline.send(request).await?.json::<ReferenceSnapshot>() }
            })
            .await
    }
}
