// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - Listening Endpoint
// Local TCP listener that tracks live connections and can be closed and reopened

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sshfwd_common::{format_host_port, is_loopback_address, ServerOptions};

const REBIND_RETRIES: u32 = 5;
const REBIND_BACKOFF: Duration = Duration::from_millis(20);

/// Local listening endpoint of a tunnel
///
/// `None` in the watch slot means the endpoint is closed. Accepting tasks hold a
/// clone of the listener only while they wait, so replacing the slot releases the socket.
#[derive(Debug)]
pub struct ListeningEndpoint {
    local_addr: SocketAddr,
    listener: watch::Sender<Option<Arc<TcpListener>>>,
    active: Arc<AtomicUsize>,
}

impl ListeningEndpoint {
    /// Bind the endpoint described by the server options
    pub async fn bind(options: &ServerOptions) -> Result<Self> {
        let addr = format_host_port(&options.host, options.port);
        let listener = bind_listener(&addr).await?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        info!("Listening on {}", local_addr);
        if !is_loopback_address(&options.host) {
            warn!(
                "{} is not a loopback address; the forward is reachable from other hosts",
                options.host
            );
        }

        let (listener, _) = watch::channel(Some(Arc::new(listener)));
        Ok(Self {
            local_addr,
            listener,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Address the endpoint is bound to (the real port when bound to port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of accepted connections that are still open
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.listener.borrow().is_some()
    }

    /// Wait for the next inbound connection
    ///
    /// While the endpoint is closed this waits for it to be reopened.
    pub async fn accept(&self) -> io::Result<InboundConnection> {
        let mut rx = self.listener.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                Some(listener) => {
                    tokio::select! {
                        accepted = listener.accept() => {
                            let (stream, peer_addr) = accepted?;
                            debug!("Accepted connection from {}", peer_addr);
                            return Ok(InboundConnection::new(stream, peer_addr, &self.active));
                        }
                        changed = rx.changed() => changed.map_err(endpoint_gone)?,
                    }
                }
                None => rx.changed().await.map_err(endpoint_gone)?,
            }
        }
    }

    /// Stop accepting connections; returns false if the endpoint was already closed
    ///
    /// Connections accepted earlier stay open.
    pub fn close(&self) -> bool {
        let previous = self.listener.send_replace(None);
        if previous.is_some() {
            info!("Stopped listening on {}", self.local_addr);
            true
        } else {
            false
        }
    }

    /// Rebind the original address after a close
    pub async fn reopen(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        // An accepting task may still hold the old socket for a moment
        let addr = self.local_addr.to_string();
        let mut tries = 0;
        let listener = loop {
            match bind_listener(&addr).await {
                Ok(listener) => break listener,
                Err(e) if tries < REBIND_RETRIES => {
                    debug!("Rebind of {} failed, retrying: {:#}", addr, e);
                    tries += 1;
                    tokio::time::sleep(REBIND_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        };
        self.listener.send_replace(Some(Arc::new(listener)));
        info!("Listening again on {}", self.local_addr);
        Ok(())
    }

    /// Resolve once the endpoint is closed
    pub async fn closed(&self) {
        let mut rx = self.listener.subscribe();
        let _ = rx.wait_for(|listener| listener.is_none()).await;
    }
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(anyhow::anyhow!(
            "Permission denied binding to {}. Ports below 1024 require elevated permissions.\n\
             Grant CAP_NET_BIND_SERVICE or pick a higher local port.",
            addr
        )),
        Err(e) => Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e)),
    }
}

fn endpoint_gone(_: watch::error::RecvError) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listening endpoint dropped")
}

/// Inbound connection accepted by a [`ListeningEndpoint`]
///
/// Counts toward the endpoint's active connections until dropped.
#[derive(Debug)]
pub struct InboundConnection {
    // Dropped before the guard: the socket is closed by the time the count goes down
    stream: TcpStream,
    peer_addr: SocketAddr,
    _guard: ConnectionGuard,
}

impl InboundConnection {
    fn new(stream: TcpStream, peer_addr: SocketAddr, active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            stream,
            peer_addr,
            _guard: ConnectionGuard(active.clone()),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

#[derive(Debug)]
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
