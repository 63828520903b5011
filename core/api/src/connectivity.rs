//! Device reachability.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::transport::{HttpRequest, HttpTransport};

/// Reports whether the device currently has a reachable network.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity state fed by the platform or by [`NetworkMonitor::probe`].
///
/// Subscribers observe every offline/online transition, which lets the
/// background scheduler drain the queue as soon as the network returns.
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    /// Create a monitor with an initial state.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    /// Record the current state; subscribers are only woken on a change.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                info!("Network connectivity restored");
            } else {
                info!("Network connectivity lost");
            }
        }
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Probe reachability with an unauthenticated request and record it.
    ///
    /// Any HTTP response counts as reachable; only a transport failure
    /// marks the device offline.
    pub async fn probe(&self, transport: &dyn HttpTransport, path: &str) -> bool {
        let online = match transport.send(&HttpRequest::get(path)).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                false
            }
        };
        self.set_online(online);
        online
    }
}

impl Connectivity for NetworkMonitor {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::Method;

    #[tokio::test]
    async fn test_transitions_notify_subscribers() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();
        assert!(!monitor.is_online());

        monitor.set_online(false);
        assert!(!rx.has_changed().unwrap());

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_probe() {
        let monitor = NetworkMonitor::new(true);
        let transport = MockTransport::new();
        transport.respond(Method::Get, "/health", 503, "");

        assert!(monitor.probe(&transport, "/health").await);

        transport.set_unreachable(true);
        assert!(!monitor.probe(&transport, "/health").await);
        assert!(!monitor.is_online());
    }
}
