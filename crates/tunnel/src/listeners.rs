// sshfwd - Connection close listeners
// Observers notified each time a forwarded inbound connection closes

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::manager::TunnelManager;

/// Observer invoked once per closed inbound connection
#[async_trait]
pub trait ConnectionCloseListener: Send + Sync {
    async fn on_connection_closed(&self, tunnel: &TunnelManager);
}

/// Registry of close listeners with set semantics on `Arc` identity
#[derive(Default)]
pub struct CloseListeners {
    listeners: RwLock<Vec<Arc<dyn ConnectionCloseListener>>>,
}

impl CloseListeners {
    /// Register a listener; returns false if it was already registered
    pub fn add(&self, listener: Arc<dyn ConnectionCloseListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener; returns false if it was not registered
    pub fn remove(&self, listener: &Arc<dyn ConnectionCloseListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Invoke every listener registered at this moment
    pub async fn notify(&self, tunnel: &TunnelManager) {
        // Snapshot so the lock is not held across listener awaits
        let snapshot: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for listener in snapshot {
            listener.on_connection_closed(tunnel).await;
        }
    }
}

fn same_listener(a: &Arc<dyn ConnectionCloseListener>, b: &Arc<dyn ConnectionCloseListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Default listener: closes the tunnel when its last connection ends
///
/// Only acts when `auto_close` is set, and never while a reconnect cycle is pending.
pub struct AutoCloseListener;

#[async_trait]
impl ConnectionCloseListener for AutoCloseListener {
    async fn on_connection_closed(&self, tunnel: &TunnelManager) {
        if !tunnel.options().auto_close || tunnel.is_closed() {
            return;
        }

        if tunnel.reconnect_pending() {
            debug!("Reconnect cycle pending, auto-close deferred");
            return;
        }

        if tunnel.endpoint().active_connections() == 0 {
            info!("Last forwarded connection closed, closing tunnel");
            tunnel.close().await;
        }
    }
}
