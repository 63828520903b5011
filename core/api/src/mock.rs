//! Scripted in-memory transport for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tillsync_common::{Error, Result};

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method};

type Handler = Arc<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>;

enum Reply {
    Response(HttpResponse),
    Failure(String),
    Handler(Handler),
}

impl Reply {
    fn produce(&self, request: &HttpRequest) -> Result<HttpResponse> {
        match self {
            Reply::Response(response) => Ok(response.clone()),
            Reply::Failure(message) => Err(Error::Network(message.clone())),
            Reply::Handler(handler) => handler(request),
        }
    }
}

/// In-memory transport with per-route scripted replies.
///
/// Replies queued for a route are consumed in order; the last one repeats
/// for any further request. Unscripted routes answer 404. Every request is
/// recorded, query and headers included.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<HttpRequest>>,
    offline: Mutex<bool>,
    delay: Option<Duration>,
}

impl MockTransport {
    /// Create a transport with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply, to widen concurrency windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a reply with a raw body.
    pub fn respond(&self, method: Method, path: &str, status: u16, body: impl Into<String>) {
        self.push(method, path, Reply::Response(HttpResponse::new(status, body)));
    }

    /// Queue a reply with a JSON body.
    pub fn respond_json(&self, method: Method, path: &str, status: u16, body: serde_json::Value) {
        self.respond(method, path, status, body.to_string());
    }

    /// Queue a transport failure.
    pub fn fail(&self, method: Method, path: &str, message: &str) {
        self.push(method, path, Reply::Failure(message.to_string()));
    }

    /// Queue a reply computed from the request.
    pub fn respond_with<F>(&self, method: Method, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        self.push(method, path, Reply::Handler(Arc::new(handler)));
    }

    /// Fail every request with `Error::Network` until switched back.
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.offline.lock().unwrap() = unreachable;
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests received for one route.
    pub fn requests_to(&self, method: Method, path: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    /// Number of requests received for one route.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.requests_to(method, path).len()
    }

    fn push(&self, method: Method, path: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if *self.offline.lock().unwrap() {
            return Err(Error::Network("Connection refused".to_string()));
        }

        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(&(request.method, request.path.clone())) {
            Some(queue) if queue.len() > 1 => {
                let reply = queue.pop_front().unwrap();
                reply.produce(request)
            }
            Some(queue) if !queue.is_empty() => queue[0].produce(request),
            _ => Ok(HttpResponse::new(404, r#"{"message":"Not found"}"#)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order_then_repeat_last() {
        let mock = MockTransport::new();
        mock.respond(Method::Get, "/orders", 500, "boom");
        mock.respond(Method::Get, "/orders", 200, "[]");

        let request = HttpRequest::get("/orders");
        assert_eq!(mock.send(&request).await.unwrap().status, 500);
        assert_eq!(mock.send(&request).await.unwrap().status, 200);
        assert_eq!(mock.send(&request).await.unwrap().status, 200);
        assert_eq!(mock.count(Method::Get, "/orders"), 3);
    }

    #[tokio::test]
    async fn test_unscripted_route_is_404() {
        let mock = MockTransport::new();
        let response = mock.send(&HttpRequest::get("/missing")).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_failures_and_unreachable() {
        let mock = MockTransport::new();
        mock.fail(Method::Post, "/orders", "timeout");

        let request = HttpRequest::post("/orders", serde_json::json!({}));
        assert!(matches!(mock.send(&request).await, Err(Error::Network(_))));

        mock.respond(Method::Get, "/health", 200, "ok");
        mock.set_unreachable(true);
        assert!(mock.send(&HttpRequest::get("/health")).await.is_err());
        mock.set_unreachable(false);
        assert!(mock.send(&HttpRequest::get("/health")).await.is_ok());
    }
}
