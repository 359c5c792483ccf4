// sshfwd - Tunnel Factory
// Builds the endpoint and the SSH client, then runs the accept loop of a tunnel

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use sshfwd_common::{ForwardOptions, ServerOptions, SshOptions, TunnelOptions};

use crate::channel::SecureChannel;
use crate::endpoint::ListeningEndpoint;
use crate::manager::TunnelManager;
use crate::ssh::SshChannelClient;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Bind the local endpoint, connect the SSH client and start forwarding
pub async fn create_tunnel(
    tunnel_options: TunnelOptions,
    server_options: &ServerOptions,
    ssh_options: SshOptions,
    forward_options: ForwardOptions,
) -> Result<TunnelManager> {
    let endpoint = ListeningEndpoint::bind(server_options)
        .await
        .context("Failed to open local listening endpoint")?;

    let channel = match SshChannelClient::connect(ssh_options).await {
        Ok(channel) => channel,
        Err(e) => {
            endpoint.close();
            return Err(e.context("Failed to establish SSH connection"));
        }
    };

    Ok(create_tunnel_with(
        tunnel_options,
        Arc::new(endpoint),
        Arc::new(channel),
        forward_options,
    ))
}

/// Start forwarding over already-built collaborators
///
/// Must be called from within a tokio runtime.
pub fn create_tunnel_with(
    tunnel_options: TunnelOptions,
    endpoint: Arc<ListeningEndpoint>,
    channel: Arc<dyn SecureChannel>,
    forward_options: ForwardOptions,
) -> TunnelManager {
    let tunnel = TunnelManager::new(endpoint, channel, tunnel_options);
    info!(
        "Forwarding {} -> {}:{}",
        tunnel.endpoint().local_addr(),
        forward_options.dst_addr,
        forward_options.dst_port
    );

    tokio::spawn(run_accept_loop(tunnel.clone(), Arc::new(forward_options)));
    tokio::spawn(end_channel_on_endpoint_close(tunnel.clone()));
    tunnel
}

/// Hand every accepted connection to `TunnelManager::forward` until the tunnel closes
async fn run_accept_loop(tunnel: TunnelManager, forward_options: Arc<ForwardOptions>) {
    let shutdown = tunnel.shutdown_token();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = tunnel.endpoint().accept() => accepted,
        };

        match accepted {
            Ok(connection) => {
                let tunnel = tunnel.clone();
                let forward_options = forward_options.clone();
                tokio::spawn(async move {
                    let peer = connection.peer_addr();
                    match tunnel.forward(connection, &forward_options).await {
                        Ok(stats) => debug!(
                            "Forward for {} done ({} bytes sent, {} bytes received)",
                            peer, stats.bytes_sent, stats.bytes_received
                        ),
                        Err(e) => debug!("Forward for {} ended: {}", peer, e),
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    debug!("Accept loop on {} stopped", tunnel.endpoint().local_addr());
}

/// End the SSH client when the endpoint closes outside a reconnect cycle
async fn end_channel_on_endpoint_close(tunnel: TunnelManager) {
    let shutdown = tunnel.shutdown_token();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tunnel.endpoint().closed() => {}
        }

        let closed_for_good = tokio::select! {
            _ = shutdown.cancelled() => break,
            closed = tunnel.endpoint_closed_for_good() => closed,
        };

        if closed_for_good {
            info!("Listening endpoint closed, ending SSH session");
            tunnel.close().await;
            break;
        }
    }
}
