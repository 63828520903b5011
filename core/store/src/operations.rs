//! Durable pending-operation table backing the offline queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;

use tillsync_common::{Error, LocalId, Result};

use crate::db::{decode_error, from_millis, to_millis, LocalStore};

/// State-changing terminal actions that must reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    OpenShift,
    CloseShift,
    OpenTill,
    CloseTill,
    CreateOrder,
    CloseOrder,
    VoidOrder,
}

impl OperationKind {
    /// All kinds, in declaration order.
    pub const ALL: [OperationKind; 7] = [
        OperationKind::OpenShift,
        OperationKind::CloseShift,
        OperationKind::OpenTill,
        OperationKind::CloseTill,
        OperationKind::CreateOrder,
        OperationKind::CloseOrder,
        OperationKind::VoidOrder,
    ];

    /// Stable name used in the database and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::OpenShift => "open-shift",
            OperationKind::CloseShift => "close-shift",
            OperationKind::OpenTill => "open-till",
            OperationKind::CloseTill => "close-till",
            OperationKind::CreateOrder => "create-order",
            OperationKind::CloseOrder => "close-order",
            OperationKind::VoidOrder => "void-order",
        }
    }

    /// Parse a stable name.
    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown operation kind: {}", value)))
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replay state of a pending operation. `Pending -> Synced` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    Pending,
    Synced,
}

impl SyncState {
    fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "PENDING",
            SyncState::Synced => "SYNCED",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(SyncState::Pending),
            "SYNCED" => Some(SyncState::Synced),
            _ => None,
        }
    }
}

/// An operation about to be recorded.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub local_id: LocalId,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewOperation {
    /// Build an operation with a fresh idempotency key.
    pub fn new(kind: OperationKind, payload: serde_json::Value) -> Self {
        Self {
            local_id: LocalId::generate(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// A recorded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Insertion sequence; defines replay order.
    pub seq: i64,
    pub local_id: LocalId,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub sync_state: SyncState,
    pub server_id: Option<String>,
    /// Failed submission attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub synced: u64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

const OPERATION_COLUMNS: &str = "seq, local_id, kind, payload, created_at_ms, sync_state, \
                                 server_id, attempts, last_error, synced_at_ms";

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    let local_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let payload: String = row.get(3)?;
    let state: String = row.get(5)?;

    Ok(PendingOperation {
        seq: row.get(0)?,
        local_id: LocalId::parse(&local_id).map_err(|e| decode_error(1, e))?,
        kind: OperationKind::parse(&kind).map_err(|e| decode_error(2, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| decode_error(3, e))?,
        created_at: from_millis(row.get(4)?),
        sync_state: SyncState::parse(&state).ok_or_else(|| {
            decode_error(
                5,
                Error::LocalStore(format!("Unknown sync state: {}", state)),
            )
        })?,
        server_id: row.get(6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        synced_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
    })
}

impl LocalStore {
    /// Durably record an operation in the `Pending` state.
    pub async fn insert_operation(&self, op: NewOperation) -> Result<PendingOperation> {
        let payload = serde_json::to_string(&op.payload)?;

        self.call(move |conn| {
            conn.execute(
                r#"
                INSERT INTO pending_operations
                (local_id, kind, payload, created_at_ms, sync_state)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    op.local_id.to_string(),
                    op.kind.as_str(),
                    payload,
                    to_millis(op.created_at),
                    SyncState::Pending.as_str(),
                ],
            )?;

            conn.query_row(
                &format!(
                    "SELECT {} FROM pending_operations WHERE seq = ?1",
                    OPERATION_COLUMNS
                ),
                params![conn.last_insert_rowid()],
                operation_from_row,
            )
        })
        .await
    }

    /// Look up one operation by its idempotency key.
    pub async fn operation(&self, local_id: LocalId) -> Result<Option<PendingOperation>> {
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM pending_operations WHERE local_id = ?1",
                    OPERATION_COLUMNS
                ),
                params![local_id.to_string()],
                operation_from_row,
            )
            .optional()
        })
        .await
    }

    /// All `Pending` operations in creation order.
    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_operations WHERE sync_state = ?1 ORDER BY seq",
                OPERATION_COLUMNS
            ))?;
            let rows = stmt.query_map(params![SyncState::Pending.as_str()], operation_from_row)?;
            rows.collect()
        })
        .await
    }

    /// Transition an operation to `Synced`.
    ///
    /// Returns `false` when the operation was not `Pending` (already synced
    /// or unknown); a synced operation is never modified again.
    pub async fn mark_operation_synced(
        &self,
        local_id: LocalId,
        server_id: Option<String>,
    ) -> Result<bool> {
        let now = to_millis(Utc::now());
        self.call(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE pending_operations
                SET sync_state = ?1, server_id = ?2, synced_at_ms = ?3, last_error = NULL
                WHERE local_id = ?4 AND sync_state = ?5
                "#,
                params![
                    SyncState::Synced.as_str(),
                    server_id,
                    now,
                    local_id.to_string(),
                    SyncState::Pending.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Count a failed submission; the operation stays `Pending`.
    pub async fn record_operation_failure(&self, local_id: LocalId, error: &str) -> Result<()> {
        let error = error.to_string();
        self.call(move |conn| {
            conn.execute(
                r#"
                UPDATE pending_operations
                SET attempts = attempts + 1, last_error = ?1
                WHERE local_id = ?2 AND sync_state = ?3
                "#,
                params![error, local_id.to_string(), SyncState::Pending.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete `Synced` operations synced before `cutoff`. `Pending`
    /// operations are never removed.
    pub async fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = to_millis(cutoff);
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM pending_operations WHERE sync_state = ?1 AND synced_at_ms < ?2",
                params![SyncState::Synced.as_str(), cutoff],
            )
        })
        .await
    }

    /// Counters for the operation queue.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.call(|conn| {
            conn.query_row(
                r#"
                SELECT
                    COALESCE(SUM(sync_state = 'PENDING'), 0),
                    COALESCE(SUM(sync_state = 'SYNCED'), 0),
                    MIN(CASE WHEN sync_state = 'PENDING' THEN created_at_ms END)
                FROM pending_operations
                "#,
                [],
                |row| {
                    Ok(QueueStats {
                        pending: row.get::<_, i64>(0)? as u64,
                        synced: row.get::<_, i64>(1)? as u64,
                        oldest_pending: row.get::<_, Option<i64>>(2)?.map(from_millis),
                    })
                },
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_operation_is_pending() {
        let store = LocalStore::in_memory().unwrap();
        let op = NewOperation::new(OperationKind::CloseTill, json!({"amount": 500}));
        let local_id = op.local_id;

        let recorded = store.insert_operation(op).await.unwrap();

        assert_eq!(recorded.local_id, local_id);
        assert_eq!(recorded.kind, OperationKind::CloseTill);
        assert_eq!(recorded.sync_state, SyncState::Pending);
        assert_eq!(recorded.payload, json!({"amount": 500}));
        assert_eq!(recorded.attempts, 0);
        assert!(recorded.server_id.is_none());
    }

    #[tokio::test]
    async fn test_pending_in_creation_order() {
        let store = LocalStore::in_memory().unwrap();
        let kinds = [
            OperationKind::OpenShift,
            OperationKind::OpenTill,
            OperationKind::CreateOrder,
            OperationKind::CloseOrder,
        ];
        for kind in kinds {
            store
                .insert_operation(NewOperation::new(kind, json!({})))
                .await
                .unwrap();
        }

        let pending = store.pending_operations().await.unwrap();
        let order: Vec<_> = pending.iter().map(|op| op.kind).collect();
        assert_eq!(order, kinds);
        assert!(pending.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_mark_synced_is_terminal() {
        let store = LocalStore::in_memory().unwrap();
        let op = store
            .insert_operation(NewOperation::new(OperationKind::OpenTill, json!({})))
            .await
            .unwrap();

        assert!(store
            .mark_operation_synced(op.local_id, Some("srv-1".to_string()))
            .await
            .unwrap());
        assert!(!store
            .mark_operation_synced(op.local_id, Some("srv-2".to_string()))
            .await
            .unwrap());

        store
            .record_operation_failure(op.local_id, "late failure")
            .await
            .unwrap();

        let stored = store.operation(op.local_id).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::Synced);
        assert_eq!(stored.server_id.as_deref(), Some("srv-1"));
        assert_eq!(stored.attempts, 0);
        assert!(stored.synced_at.is_some());
        assert!(store.pending_operations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_failure_keeps_pending() {
        let store = LocalStore::in_memory().unwrap();
        let op = store
            .insert_operation(NewOperation::new(OperationKind::VoidOrder, json!({})))
            .await
            .unwrap();

        store
            .record_operation_failure(op.local_id, "timeout")
            .await
            .unwrap();
        store
            .record_operation_failure(op.local_id, "502")
            .await
            .unwrap();

        let stored = store.operation(op.local_id).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::Pending);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("502"));
    }

    #[tokio::test]
    async fn test_purge_only_old_synced() {
        let store = LocalStore::in_memory().unwrap();
        let synced = store
            .insert_operation(NewOperation::new(OperationKind::OpenShift, json!({})))
            .await
            .unwrap();
        let pending = store
            .insert_operation(NewOperation {
                created_at: Utc::now() - Duration::days(30),
                ..NewOperation::new(OperationKind::CloseShift, json!({}))
            })
            .await
            .unwrap();
        store
            .mark_operation_synced(synced.local_id, None)
            .await
            .unwrap();

        // Horizon in the past: nothing synced long enough ago.
        let purged = store
            .purge_synced_before(Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = store
            .purge_synced_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        assert!(store.operation(synced.local_id).await.unwrap().is_none());
        assert!(store.operation(pending.local_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let store = LocalStore::in_memory().unwrap();
        assert_eq!(store.queue_stats().await.unwrap(), QueueStats::default());

        let first = store
            .insert_operation(NewOperation::new(OperationKind::OpenShift, json!({})))
            .await
            .unwrap();
        store
            .insert_operation(NewOperation::new(OperationKind::OpenTill, json!({})))
            .await
            .unwrap();
        store
            .mark_operation_synced(first.local_id, None)
            .await
            .unwrap();

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.synced, 1);
        assert!(stats.oldest_pending.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_local_id_rejected() {
        let store = LocalStore::in_memory().unwrap();
        let op = NewOperation::new(OperationKind::CreateOrder, json!({}));

        store.insert_operation(op.clone()).await.unwrap();
        let result = store.insert_operation(op).await;
        assert!(matches!(result, Err(Error::LocalStore(_))));
    }

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(OperationKind::parse("refund").is_err());
        assert_eq!(
            serde_json::to_string(&OperationKind::CloseTill).unwrap(),
            "\"close-till\""
        );
    }
}
