//! Terminal runtime for Tillsync.
//!
//! This module provides:
//! - The terminal configuration file
//! - A `Terminal` service object wiring store, session, pipeline and sync
//! - Typed builders for queued operations
//! - The operator identity cache, cleared on forced logout
//!
//! # Architecture
//! The UI talks only to `Terminal`. Reads come from the local store;
//! state-changing actions go through the operation queue so they survive
//! connectivity loss.

pub mod config;
pub mod identity;
pub mod operations;
pub mod terminal;

pub use config::{TerminalConfig, DEFAULT_DATABASE_FILE};
pub use identity::{IdentityCache, Operator};
pub use operations::{OrderLine, TerminalOperation};
pub use terminal::{resync_for, OperationStatus, Terminal, TerminalStatus};
