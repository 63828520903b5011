//! Tillsync Local Store
//!
//! Embedded SQLite store that the terminal reads from when disconnected:
//! - Versioned schema migrations
//! - The persisted session credential
//! - Cached reference data (categories, products, sizes, price tiers)
//! - The durable pending-operation queue
//! - Sync cursors and the identity cache

pub mod credentials;
pub mod db;
pub mod identity;
pub mod operations;
pub mod reference;
mod schema;

pub use credentials::CredentialStore;
pub use db::LocalStore;
pub use operations::{NewOperation, OperationKind, PendingOperation, QueueStats, SyncState};
pub use reference::{
    ApplyStats, Category, PriceTier, Product, ReferenceCounts, ReferenceSnapshot, ReferenceTable,
    Size, SyncTarget,
};
