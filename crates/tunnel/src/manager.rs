// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - Tunnel Manager
// Forwards inbound connections over the secure channel and runs the reconnect policy

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::copy_bidirectional;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sshfwd_common::{ForwardOptions, TunnelEvent, TunnelOptions, TunnelState, Utc};

use crate::channel::{ForwardStream, SecureChannel};
use crate::endpoint::{InboundConnection, ListeningEndpoint};
use crate::error::{ChannelError, ForwardError};
use crate::listeners::{AutoCloseListener, CloseListeners, ConnectionCloseListener};

/// Byte counts of a finished pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub peer: SocketAddr,
    /// Bytes relayed from the inbound connection to the remote side
    pub bytes_sent: u64,
    /// Bytes relayed from the remote side to the inbound connection
    pub bytes_received: u64,
}

/// Lifecycle manager of one tunnel: one listening endpoint, one secure channel
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Arc<ListeningEndpoint>,
    channel: Arc<dyn SecureChannel>,
    options: TunnelOptions,
    /// Root token; every forward attempt runs on a child of it
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_listeners: CloseListeners,
    /// Forward attempts that have not produced a pipe or a terminal error yet
    attempts: AtomicUsize,
    /// Pipes currently relaying bytes
    pipes: AtomicUsize,
    /// Attempts inside a reconnect cycle (including waiting for the lock)
    pending_reconnects: AtomicUsize,
    /// Held for the whole close/end/delay/reconnect/reopen sequence
    reconnect_lock: Mutex<()>,
    /// Bumped by every completed reconnect cycle
    generation: AtomicU64,
    cycles: AtomicU32,
    event_tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelManager {
    /// Build a manager around live collaborators
    ///
    /// The auto-close listener is registered here; it only acts when
    /// `options.auto_close` is set.
    pub fn new(
        endpoint: Arc<ListeningEndpoint>,
        channel: Arc<dyn SecureChannel>,
        options: TunnelOptions,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let manager = Self {
            inner: Arc::new(Inner {
                endpoint,
                channel,
                options,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                close_listeners: CloseListeners::default(),
                attempts: AtomicUsize::new(0),
                pipes: AtomicUsize::new(0),
                pending_reconnects: AtomicUsize::new(0),
                reconnect_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                cycles: AtomicU32::new(0),
                event_tx,
            }),
        };
        manager
            .inner
            .close_listeners
            .add(Arc::new(AutoCloseListener));
        manager
    }

    pub fn endpoint(&self) -> &Arc<ListeningEndpoint> {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.inner.options
    }

    /// Subscribe to tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Token cancelled by `close()`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Resolve once the tunnel is closed
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// True while a forward attempt is in flight and the tunnel is open
    pub fn is_connecting(&self) -> bool {
        !self.is_closed() && self.inner.attempts.load(Ordering::SeqCst) > 0
    }

    /// True while a reconnect cycle is running or waiting to run
    pub fn reconnect_pending(&self) -> bool {
        self.inner.pending_reconnects.load(Ordering::SeqCst) > 0
    }

    /// Reconnect cycles performed since the tunnel was created
    pub fn reconnect_cycles(&self) -> u32 {
        self.inner.cycles.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TunnelState {
        if self.is_closed() {
            TunnelState::Closed
        } else if self.reconnect_pending() {
            TunnelState::ReconnectWait
        } else if self.inner.attempts.load(Ordering::SeqCst) > 0 {
            TunnelState::Connecting
        } else if self.inner.pipes.load(Ordering::SeqCst) > 0 {
            TunnelState::Forwarding
        } else {
            TunnelState::Idle
        }
    }

    /// Register a close listener; false if it is already registered
    pub fn add_connection_close_listener(&self, listener: Arc<dyn ConnectionCloseListener>) -> bool {
        self.inner.close_listeners.add(listener)
    }

    /// Unregister a close listener; false if it was not registered
    pub fn remove_connection_close_listener(&self, listener: &Arc<dyn ConnectionCloseListener>) -> bool {
        self.inner.close_listeners.remove(listener)
    }

    /// Forward one inbound connection to `target` until either side closes
    ///
    /// The connection is dropped before the close listeners run, whatever the
    /// outcome, so they observe the decremented active-connection count.
    pub async fn forward(
        &self,
        mut connection: InboundConnection,
        target: &ForwardOptions,
    ) -> Result<ForwardStats, ForwardError> {
        let peer = connection.peer_addr();
        let token = self.inner.shutdown.child_token();

        let result = match self.open_with_retry(target, &token).await {
            Ok(mut sub_stream) => self.pipe(&mut connection, &mut sub_stream).await,
            Err(e) => Err(e),
        };
        drop(connection);

        let (bytes_sent, bytes_received) = match &result {
            Ok(stats) => (stats.bytes_sent, stats.bytes_received),
            Err(_) => (0, 0),
        };
        self.emit(TunnelEvent::ConnectionClosed {
            peer,
            bytes_sent,
            bytes_received,
            timestamp: Utc::now(),
        });

        self.inner.close_listeners.notify(self).await;
        result
    }

    /// Stop accepting, end the channel and cancel in-flight attempts; safe to repeat
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.endpoint.close();
        self.inner.channel.end().await;

        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!("Tunnel on {} closed", self.inner.endpoint.local_addr());
            self.emit(TunnelEvent::Closed {
                timestamp: Utc::now(),
            });
        }
    }

    /// True when the endpoint is closed and no reconnect cycle accounts for it
    pub(crate) async fn endpoint_closed_for_good(&self) -> bool {
        let _cycle = self.inner.reconnect_lock.lock().await;
        !self.inner.endpoint.is_open()
    }

    async fn open_with_retry(
        &self,
        target: &ForwardOptions,
        token: &CancellationToken,
    ) -> Result<Box<dyn ForwardStream>, ForwardError> {
        let _attempt = CountGuard::new(&self.inner.attempts);
        let mut remaining = self.inner.options.auto_reconnect_count;
        let mut cycles = 0;

        loop {
            if token.is_cancelled() {
                return Err(ForwardError::Cancelled);
            }

            let generation = self.inner.generation.load(Ordering::SeqCst);
            let err = match self
                .inner
                .channel
                .open_forward(&target.src_addr, target.src_port, &target.dst_addr, target.dst_port)
                .await
            {
                Ok(sub_stream) => return Ok(sub_stream),
                Err(e) => e,
            };

            if token.is_cancelled() {
                debug!("Forward to {}:{} failed after close: {}", target.dst_addr, target.dst_port, err);
                return Err(ForwardError::Cancelled);
            }

            if !err.is_transient() || !self.inner.options.auto_reconnect {
                return Err(ForwardError::Channel(err));
            }

            if remaining == 0 {
                warn!(
                    "Giving up on forward to {}:{} after {} reconnect cycles: {}",
                    target.dst_addr, target.dst_port, cycles, err
                );
                return Err(ForwardError::RetriesExhausted {
                    attempts: cycles,
                    last: err,
                });
            }
            remaining -= 1;
            cycles += 1;

            self.reconnect_cycle(generation, &err, token).await?;
        }
    }

    /// Close the endpoint, end the channel, wait, then reconnect and reopen
    ///
    /// Skipped when another attempt completed a cycle after `observed_generation`.
    async fn reconnect_cycle(
        &self,
        observed_generation: u64,
        reason: &ChannelError,
        token: &CancellationToken,
    ) -> Result<(), ForwardError> {
        let _pending = CountGuard::new(&self.inner.pending_reconnects);

        let _cycle = tokio::select! {
            guard = self.inner.reconnect_lock.lock() => guard,
            _ = token.cancelled() => return Err(ForwardError::Cancelled),
        };

        if self.inner.generation.load(Ordering::SeqCst) != observed_generation {
            debug!("Tunnel already reconnected by another connection, retrying");
            return Ok(());
        }
        if token.is_cancelled() {
            return Err(ForwardError::Cancelled);
        }

        let attempt = self.inner.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        warn!("Forwarded channel failed ({}), reconnect cycle {} starting", reason, attempt);
        self.emit(TunnelEvent::Reconnecting {
            attempt,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });

        self.inner.endpoint.close();
        self.inner.channel.end().await;

        let delay = Duration::from_millis(self.inner.options.reconnect_delay_ms);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => return Err(ForwardError::Cancelled),
        }
        if token.is_cancelled() {
            return Err(ForwardError::Cancelled);
        }

        if let Err(e) = self.inner.channel.reconnect().await {
            warn!("Reconnect cycle {}: SSH reconnect failed: {}", attempt, e);
        }
        if let Err(e) = self.inner.endpoint.reopen().await {
            warn!("Reconnect cycle {}: failed to reopen listener: {:#}", attempt, e);
        }

        // close() may have run while reconnecting
        if token.is_cancelled() {
            self.inner.endpoint.close();
            self.inner.channel.end().await;
            return Err(ForwardError::Cancelled);
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        info!("Reconnect cycle {} finished", attempt);
        self.emit(TunnelEvent::Reconnected {
            attempt,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn pipe(
        &self,
        connection: &mut InboundConnection,
        sub_stream: &mut Box<dyn ForwardStream>,
    ) -> Result<ForwardStats, ForwardError> {
        let _pipe = CountGuard::new(&self.inner.pipes);
        let peer = connection.peer_addr();
        debug!("Forwarding {} through the tunnel", peer);
        self.emit(TunnelEvent::Forwarding {
            peer,
            timestamp: Utc::now(),
        });

        let (bytes_sent, bytes_received) =
            copy_bidirectional(connection.stream_mut(), sub_stream).await?;

        debug!(
            "Forward connection {} closed: {} bytes sent, {} bytes received",
            peer, bytes_sent, bytes_received
        );
        Ok(ForwardStats {
            peer,
            bytes_sent,
            bytes_received,
        })
    }

    fn emit(&self, event: TunnelEvent) {
        if let Err(e) = self.inner.event_tx.send(event) {
            debug!("No subscribers for tunnel event: {}", e);
        }
    }
}

/// Increments a counter for its lifetime
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
