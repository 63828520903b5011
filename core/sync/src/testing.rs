//! Shared fixture: an in-memory store behind a pipeline over a mock transport.

use std::sync::Arc;

use tillsync_api::{MockTransport, NetworkMonitor, RequestPipeline, SessionManager};
use tillsync_common::{Credential, DeviceId, TenantId};
use tillsync_store::{CredentialStore, LocalStore};

pub(crate) struct Harness {
    pub store: LocalStore,
    pub transport: Arc<MockTransport>,
    pub monitor: NetworkMonitor,
    pub pipeline: Arc<RequestPipeline>,
    pub tenant: TenantId,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_transport(MockTransport::new()).await
    }

    pub async fn with_transport(transport: MockTransport) -> Self {
        let transport = Arc::new(transport);
        let store = LocalStore::in_memory().unwrap();
        store
            .save(&Credential::new("access", Some("refresh".to_string())))
            .await
            .unwrap();

        let device_id = DeviceId::new("dev-1").unwrap();
        let session = Arc::new(SessionManager::new(
            Arc::new(store.clone()),
            transport.clone(),
            device_id.clone(),
            "/auth/refresh",
        ));
        let monitor = NetworkMonitor::new(true);
        let pipeline = Arc::new(RequestPipeline::new(
            transport.clone(),
            session,
            Arc::new(monitor.clone()),
            device_id,
        ));

        Self {
            store,
            transport,
            monitor,
            pipeline,
            tenant: TenantId::new("tenant-1").unwrap(),
        }
    }
}
