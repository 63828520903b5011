//! Tillsync API
//!
//! Authenticated access to the remote POS backend:
//! - `HttpTransport` with a reqwest implementation, plus a scripted mock
//!   behind the `mock` feature
//! - Connectivity monitoring
//! - Session credential ownership with single-flight refresh
//! - The request pipeline (401 classification, retry-once, forced teardown)

pub mod classify;
pub mod config;
pub mod connectivity;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pipeline;
pub mod session;
pub mod transport;

pub use classify::{classify_unauthorized, AuthFailure};
pub use config::ApiConfig;
pub use connectivity::{Connectivity, NetworkMonitor};
#[cfg(any(test, feature = "mock"))]
pub use mock::MockTransport;
pub use pipeline::{RequestPipeline, DEVICE_ID_HEADER, IDEMPOTENCY_KEY_HEADER};
pub use session::{RefreshFailure, SessionManager, TeardownHook};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
