//! Common utilities and types shared across Tillsync modules.
//!
//! This module provides the error taxonomy every component reports in and
//! the identifiers that cross component boundaries.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{BranchId, Credential, DeviceId, LocalId, TenantId};
