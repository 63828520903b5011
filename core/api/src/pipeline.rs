//! The single authenticated path to the remote API.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error, warn};

use tillsync_common::{DeviceId, Error, LocalId, Result};

use crate::classify::{classify_unauthorized, AuthFailure};
use crate::connectivity::Connectivity;
use crate::session::SessionManager;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Header identifying the terminal on every request.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";
/// Header carrying an operation's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

const UNAUTHORIZED: u16 = 401;

/// Wraps every remote call with the connectivity gate, bearer injection,
/// 401 recovery and forced teardown.
pub struct RequestPipeline {
    transport: Arc<dyn HttpTransport>,
    session: Arc<SessionManager>,
    connectivity: Arc<dyn Connectivity>,
    device_id: DeviceId,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        session: Arc<SessionManager>,
        connectivity: Arc<dyn Connectivity>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            transport,
            session,
            connectivity,
            device_id,
        }
    }

    /// The session manager this pipeline refreshes through.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Issue a request, recovering once from an expired access token.
    ///
    /// Non-401 responses are returned unchanged, whatever their status. A
    /// 401 whose body says the token expired triggers one refresh and one
    /// retry; any other 401, a failed refresh, or a second 401 tears the
    /// session down.
    ///
    /// # Errors
    /// - `Offline` when the device has no network; nothing is sent
    /// - `SessionExpired` after a forced teardown
    /// - `Network` on transport failure
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        if !self.connectivity.is_online() {
            debug!("Offline; not sending {} {}", request.method, request.path);
            return Err(Error::Offline);
        }

        let request = request.header(DEVICE_ID_HEADER, self.device_id.as_str());
        let token = self.session.access_token().await?;
        let response = self.transport.send(&request.with_bearer(token)).await?;

        if response.status != UNAUTHORIZED {
            return Ok(response);
        }

        match classify_unauthorized(&response.body) {
            AuthFailure::TokenExpired => {
                debug!("Access token expired on {} {}", request.method, request.path);
            }
            failure => {
                warn!(
                    "{} {} unauthorized ({:?}); ending session",
                    request.method, request.path, failure
                );
                return self.expire_session().await;
            }
        }

        let token = match self.session.refresh().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                return self.expire_session().await;
            }
        };

        let retried = self.transport.send(&request.with_bearer(Some(token))).await?;
        if retried.status == UNAUTHORIZED {
            warn!(
                "{} {} still unauthorized after refresh; ending session",
                request.method, request.path
            );
            return self.expire_session().await;
        }

        Ok(retried)
    }

    /// Like [`execute`](Self::execute), but non-2xx becomes `RemoteRejected`.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.execute(request).await?.error_for_status()
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse> {
        self.send(HttpRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<HttpResponse> {
        self.send(HttpRequest::post(path, body)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        self.post(path, body).await?.json()
    }

    /// `POST` carrying an idempotency key header.
    pub async fn post_idempotent(
        &self,
        path: &str,
        body: serde_json::Value,
        key: LocalId,
    ) -> Result<HttpResponse> {
        self.send(HttpRequest::post(path, body).header(IDEMPOTENCY_KEY_HEADER, key.to_string()))
            .await
    }

    async fn expire_session<T>(&self) -> Result<T> {
        if let Err(e) = self.session.teardown().await {
            error!("Session teardown failed: {}", e);
        }
        Err(Error::SessionExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::NetworkMonitor;
    use crate::mock::MockTransport;
    use crate::session::TeardownHook;
    use crate::transport::Method;
    use async_trait::async_trait;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tillsync_common::Credential;
    use tillsync_store::{CredentialStore, LocalStore};

    const REFRESH: &str = "/auth/refresh";
    const EXPIRED: &str = r#"{"code":"TOKEN_EXPIRED","message":"jwt expired"}"#;

    #[derive(Default)]
    struct CountingHook {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TeardownHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_teardown(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        pipeline: Arc<RequestPipeline>,
        transport: Arc<MockTransport>,
        monitor: NetworkMonitor,
        store: LocalStore,
        hook: Arc<CountingHook>,
    }

    async fn fixture(transport: MockTransport) -> Fixture {
        let transport = Arc::new(transport);
        let store = LocalStore::in_memory().unwrap();
        store
            .save(&Credential::new("a1", Some("r1".to_string())))
            .await
            .unwrap();

        let device_id = DeviceId::new("dev-1").unwrap();
        let session = Arc::new(SessionManager::new(
            Arc::new(store.clone()),
            transport.clone(),
            device_id.clone(),
            REFRESH,
        ));
        let hook = Arc::new(CountingHook::default());
        session.on_teardown(hook.clone());

        let monitor = NetworkMonitor::new(true);
        let pipeline = Arc::new(RequestPipeline::new(
            transport.clone(),
            session,
            Arc::new(monitor.clone()),
            device_id,
        ));

        Fixture {
            pipeline,
            transport,
            monitor,
            store,
            hook,
        }
    }

    fn expire_old_token(request: &HttpRequest) -> Result<HttpResponse> {
        if request.bearer.as_deref() == Some("a1") {
            Ok(HttpResponse::new(401, EXPIRED))
        } else {
            Ok(HttpResponse::new(200, r#"[{"id":"o-1"}]"#))
        }
    }

    #[tokio::test]
    async fn test_offline_fails_without_request() {
        let f = fixture(MockTransport::new()).await;
        f.monitor.set_online(false);

        let result = f.pipeline.get("/orders").await;

        assert!(matches!(result, Err(Error::Offline)));
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_attaches_bearer_and_device_id() {
        let f = fixture(MockTransport::new()).await;
        f.transport.respond(Method::Get, "/orders", 200, "[]");

        f.pipeline.get("/orders").await.unwrap();

        let sent = &f.transport.requests()[0];
        assert_eq!(sent.bearer.as_deref(), Some("a1"));
        assert_eq!(sent.header_value(DEVICE_ID_HEADER), Some("dev-1"));
    }

    #[tokio::test]
    async fn test_non_401_passes_through() {
        let f = fixture(MockTransport::new()).await;
        f.transport
            .respond(Method::Post, "/orders", 422, r#"{"message":"Invalid total"}"#);

        let response = f
            .pipeline
            .execute(HttpRequest::post("/orders", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status, 422);

        let err = f.pipeline.post("/orders", json!({})).await.unwrap_err();
        assert_eq!(err.user_message(), "Invalid total");
        assert_eq!(f.transport.count(Method::Post, REFRESH), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_and_retries_once() {
        let f = fixture(MockTransport::new()).await;
        f.transport
            .respond_with(Method::Get, "/orders", expire_old_token);
        f.transport
            .respond_json(Method::Post, REFRESH, 200, json!({"accessToken": "a2"}));

        let orders: Vec<serde_json::Value> = f.pipeline.get_json("/orders").await.unwrap();

        assert_eq!(orders, vec![json!({"id": "o-1"})]);
        assert_eq!(f.transport.count(Method::Post, REFRESH), 1);

        let calls = f.transport.requests_to(Method::Get, "/orders");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].bearer.as_deref(), Some("a2"));
        assert_eq!(f.hook.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_401_tears_down_without_second_refresh() {
        let f = fixture(MockTransport::new()).await;
        f.transport.respond(Method::Get, "/orders", 401, EXPIRED);
        f.transport
            .respond_json(Method::Post, REFRESH, 200, json!({"accessToken": "a2"}));

        let result = f.pipeline.get("/orders").await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert_eq!(f.transport.count(Method::Get, "/orders"), 2);
        assert_eq!(f.transport.count(Method::Post, REFRESH), 1);
        assert!(f.store.load().await.unwrap().is_none());
        assert_eq!(f.hook.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revoked_tears_down_without_refresh() {
        for body in [r#"{"code":"USER_DISABLED"}"#, "Unauthorized"] {
            let f = fixture(MockTransport::new()).await;
            f.transport.respond(Method::Get, "/orders", 401, body);

            let result = f.pipeline.get("/orders").await;

            assert!(matches!(result, Err(Error::SessionExpired)));
            assert_eq!(f.transport.count(Method::Get, "/orders"), 1);
            assert_eq!(f.transport.count(Method::Post, REFRESH), 0);
            assert!(f.store.load().await.unwrap().is_none());
            assert_eq!(f.hook.runs.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_tears_down() {
        let f = fixture(MockTransport::new()).await;
        f.transport.respond(Method::Get, "/orders", 401, EXPIRED);
        f.transport
            .respond(Method::Post, REFRESH, 400, r#"{"error":"invalid_grant"}"#);

        let result = f.pipeline.get("/orders").await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert_eq!(f.transport.count(Method::Get, "/orders"), 1);
        assert!(f.store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_network_failure_is_not_teardown() {
        let f = fixture(MockTransport::new()).await;
        f.transport.fail(Method::Get, "/orders", "connection reset");

        let result = f.pipeline.get("/orders").await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert!(f.store.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_idempotency_key_header() {
        let f = fixture(MockTransport::new()).await;
        f.transport.respond(Method::Post, "/tills/close", 201, "{}");
        let key = LocalId::generate();

        f.pipeline
            .post_idempotent("/tills/close", json!({"amount": 500}), key)
            .await
            .unwrap();

        let sent = &f.transport.requests()[0];
        assert_eq!(
            sent.header_value(IDEMPOTENCY_KEY_HEADER),
            Some(key.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_concurrent_expired_calls_share_one_refresh() {
        let f = fixture(MockTransport::new().with_delay(Duration::from_millis(50))).await;
        f.transport
            .respond_with(Method::Get, "/orders", expire_old_token);
        f.transport
            .respond_json(Method::Post, REFRESH, 200, json!({"accessToken": "a2"}));

        let results = join_all((0..10).map(|_| f.pipeline.get("/orders"))).await;

        for result in results {
            assert_eq!(result.unwrap().status, 200);
        }
        assert_eq!(f.transport.count(Method::Post, REFRESH), 1);
        assert_eq!(f.transport.count(Method::Get, "/orders"), 20);
    }
}
