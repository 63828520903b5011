//! Tillsync Sync Engine
//!
//! Keeps the terminal's local store consistent with the backend:
//! - Reconciliation of reference data (full or incremental, atomic)
//! - The offline operation queue, drained in creation order
//! - Realtime invalidation signals over a WebSocket
//! - Retry strategy with exponential backoff
//! - Background scheduling of drains and resyncs

pub mod queue;
pub mod realtime;
pub mod reconcile;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use queue::{endpoint_for, DrainReport, OperationQueue, DEFAULT_RETENTION_DAYS};
pub use realtime::{
    DeviceIdentity, InvalidationChannel, InvalidationHandler, InvalidationSignal,
    InvalidationTopic, RealtimeConfig, RealtimeHandle,
};
pub use reconcile::{ReconciliationSync, SyncReport, REFERENCE_PATH};
pub use retry::{is_retryable, RetryConfig, RetryExecutor};
pub use scheduler::{SchedulerConfig, SyncOutcome, SyncRequest, SyncScheduler, SyncSchedulerHandle};
