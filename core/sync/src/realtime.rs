//! Server-pushed invalidation signals over a persistent WebSocket.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use tillsync_common::{BranchId, DeviceId, TenantId};
use tillsync_store::SyncTarget;

use crate::retry::{millis, RetryConfig};

/// Scope value addressing every device.
pub const GLOBAL_SCOPE: &str = "*";

/// What changed on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationTopic {
    CatalogChanged,
    PricingChanged,
    OrderChanged,
}

impl InvalidationTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationTopic::CatalogChanged => "catalog.changed",
            InvalidationTopic::PricingChanged => "pricing.changed",
            InvalidationTopic::OrderChanged => "order.changed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "catalog.changed" => Some(InvalidationTopic::CatalogChanged),
            "pricing.changed" => Some(InvalidationTopic::PricingChanged),
            "order.changed" => Some(InvalidationTopic::OrderChanged),
            _ => None,
        }
    }

    /// Reference data to resync, if the topic maps to any.
    pub fn sync_target(&self) -> Option<SyncTarget> {
        match self {
            InvalidationTopic::CatalogChanged => Some(SyncTarget::Catalog),
            InvalidationTopic::PricingChanged => Some(SyncTarget::Pricing),
            InvalidationTopic::OrderChanged => None,
        }
    }
}

impl fmt::Display for InvalidationTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ephemeral "something changed" notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationSignal {
    pub topic: InvalidationTopic,
    pub scope: String,
}

#[derive(Deserialize)]
struct SignalFrame {
    topic: String,
    scope: String,
}

impl InvalidationSignal {
    /// Parse a text frame. Malformed frames and unknown topics yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let frame: SignalFrame = serde_json::from_str(text).ok()?;
        Some(Self {
            topic: InvalidationTopic::parse(&frame.topic)?,
            scope: frame.scope,
        })
    }

    /// Whether the signal addresses this device's branch, its tenant, or
    /// every device.
    pub fn applies_to(&self, identity: &DeviceIdentity) -> bool {
        self.scope == GLOBAL_SCOPE
            || self.scope == identity.branch_id.as_str()
            || self.scope == identity.tenant_id.as_str()
    }
}

/// Who this terminal is, as announced on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub branch_id: BranchId,
    pub tenant_id: TenantId,
}

impl DeviceIdentity {
    fn register_frame(&self) -> String {
        serde_json::json!({
            "type": "register",
            "deviceId": self.device_id.as_str(),
            "branchId": self.branch_id.as_str(),
        })
        .to_string()
    }
}

/// Realtime channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Reconnect backoff; `max_retries` is ignored, reconnects never stop.
    pub reconnect: RetryConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/realtime".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect: RetryConfig::new(0)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30)),
        }
    }
}

/// Callback invoked once per relevant signal.
pub type InvalidationHandler = Arc<dyn Fn(&InvalidationSignal) + Send + Sync>;

/// Observer list plus connection factory for the push channel.
#[derive(Clone)]
pub struct InvalidationChannel {
    config: RealtimeConfig,
    handlers: Arc<RwLock<Vec<InvalidationHandler>>>,
}

impl InvalidationChannel {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a handler for relevant signals.
    pub fn on_invalidation(&self, handler: InvalidationHandler) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    /// Start the connection task.
    ///
    /// The task reconnects with capped exponential backoff until
    /// [`RealtimeHandle::shutdown`]; connection loss is logged, never
    /// surfaced.
    pub fn connect(&self, identity: DeviceIdentity) -> RealtimeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            self.config.clone(),
            identity,
            Arc::clone(&self.handlers),
            shutdown_rx,
            connected_tx,
        ));

        RealtimeHandle {
            shutdown: shutdown_tx,
            connected: connected_rx,
            task,
        }
    }
}

/// Handle to a running connection task.
pub struct RealtimeHandle {
    shutdown: watch::Sender<bool>,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    /// Whether the socket is currently registered.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch connection state.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Close the socket and stop reconnecting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Realtime task ended abnormally: {}", e);
        }
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run(
    config: RealtimeConfig,
    identity: DeviceIdentity,
    handlers: Arc<RwLock<Vec<InvalidationHandler>>>,
    mut shutdown: watch::Receiver<bool>,
    connected: watch::Sender<bool>,
) {
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
            Ok(Ok((socket, _))) => {
                info!("Realtime channel connected to {}", config.url);
                attempt = 0;
                let end = session(socket, &identity, &handlers, &mut shutdown, &connected).await;
                connected.send_replace(false);
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Disconnected(reason) => {
                        warn!("Realtime channel disconnected: {}", reason);
                    }
                }
            }
            Ok(Err(e)) => warn!("Realtime connect failed: {}", e),
            Err(_) => warn!("Realtime connect timed out after {:?}", config.connect_timeout),
        }

        let delay = config.reconnect.backoff(attempt);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting realtime channel in {:?}", delay);

        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown.changed() => {
                // Handle dropped without an explicit shutdown.
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("Realtime channel stopped");
}

async fn session(
    socket: Socket,
    identity: &DeviceIdentity,
    handlers: &RwLock<Vec<InvalidationHandler>>,
    shutdown: &mut watch::Receiver<bool>,
    connected: &watch::Sender<bool>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    if let Err(e) = sink.send(Message::Text(identity.register_frame())).await {
        return SessionEnd::Disconnected(format!("register failed: {}", e));
    }
    connected.send_replace(true);
    debug!("Registered device {}", identity.device_id);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(&text, identity, handlers),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        return SessionEnd::Disconnected(e.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Disconnected("closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
            }
        }
    }
}

fn dispatch(text: &str, identity: &DeviceIdentity, handlers: &RwLock<Vec<InvalidationHandler>>) {
    let Some(signal) = InvalidationSignal::parse(text) else {
        debug!("Ignoring realtime frame: {}", text);
        return;
    };

    if !signal.applies_to(identity) {
        debug!("Ignoring {} for scope {}", signal.topic, signal.scope);
        return;
    }

    let handlers = match handlers.read() {
        Ok(handlers) => handlers.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    debug!(
        "Dispatching {} ({}) to {} handlers",
        signal.topic,
        signal.scope,
        handlers.len()
    );
    for handler in handlers {
        handler(&signal);
    }
}
