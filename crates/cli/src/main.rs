// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - CLI
// Forwards a local port through an SSH server until Ctrl+C or auto-close

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sshfwd_common::{format_host_port, HostKeyPolicy, TunnelConfig, TunnelEvent};
use sshfwd_tunnel::create_tunnel;

#[derive(Parser, Debug)]
#[command(name = "sshfwd")]
#[command(about = "Forward a local port through an SSH server", long_about = None)]
#[command(version)]
pub struct Cli {
    /// SSH server as [user@]host[:port]
    pub destination: Option<String>,

    /// Tunnel configuration file (default: <config dir>/sshfwd/tunnel.toml)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Local forward as [bind_address:]port:host:hostport
    #[arg(short = 'L', long, value_name = "SPEC")]
    pub local_forward: Option<String>,

    /// Private key for public key authentication
    #[arg(short = 'i', long, value_name = "FILE")]
    pub identity: Option<PathBuf>,

    /// Authenticate with a password (ssh.password or SSHFWD_PASSWORD)
    #[arg(long)]
    pub password_auth: bool,

    /// known_hosts file used for host key verification
    #[arg(long, value_name = "FILE")]
    pub known_hosts: Option<PathBuf>,

    /// Host key policy: strict, accept-new or off
    #[arg(long, value_name = "POLICY")]
    pub host_key_policy: Option<HostKeyPolicy>,

    /// Close the tunnel when its last connection ends
    #[arg(long)]
    pub auto_close: bool,

    /// Reconnect when the SSH session stops answering
    #[arg(long)]
    pub auto_reconnect: bool,

    /// Reconnect cycles allowed per connection
    #[arg(long, value_name = "N")]
    pub reconnect_count: Option<u32>,

    /// Pause before reconnecting, in milliseconds
    #[arg(long, value_name = "MS")]
    pub reconnect_delay_ms: Option<u64>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = config::resolve(&cli)?;
    run(config).await
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "sshfwd=info,sshfwd_tunnel=info,sshfwd_common=info",
        1 => "sshfwd=debug,sshfwd_tunnel=debug,sshfwd_common=debug",
        _ => "sshfwd=trace,sshfwd_tunnel=trace,sshfwd_common=trace,russh=debug",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: TunnelConfig) -> Result<()> {
    let TunnelConfig {
        tunnel,
        server,
        ssh,
        forward,
    } = config;

    let destination = format_host_port(&forward.dst_addr, forward.dst_port);
    let via = format!("{}@{}", ssh.username, format_host_port(&ssh.host, ssh.port));

    let manager = create_tunnel(tunnel, &server, ssh, forward).await?;
    println!(
        "{} {} -> {} via {}",
        "✓ Forwarding".green().bold(),
        manager.endpoint().local_addr(),
        destination,
        via
    );

    let events = tokio::spawn(print_events(manager.subscribe()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down");
        }
        _ = manager.closed() => {
            info!("Tunnel closed");
        }
    }

    manager.close().await;
    events.abort();
    println!("{}", "✓ Tunnel closed".green().bold());
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<TunnelEvent>) {
    loop {
        match events.recv().await {
            Ok(TunnelEvent::Forwarding { peer, .. }) => {
                debug!("Forwarding connection from {}", peer);
            }
            Ok(TunnelEvent::ConnectionClosed {
                peer,
                bytes_sent,
                bytes_received,
                ..
            }) => {
                debug!(
                    "Connection from {} closed ({} bytes sent, {} bytes received)",
                    peer, bytes_sent, bytes_received
                );
            }
            Ok(TunnelEvent::Reconnecting { attempt, reason, .. }) => {
                println!(
                    "{}",
                    format!("⟳ Reconnecting (cycle {}): {}", attempt, reason).yellow()
                );
            }
            Ok(TunnelEvent::Reconnected { attempt, .. }) => {
                println!("{}", format!("✓ Reconnected (cycle {})", attempt).green());
            }
            Ok(TunnelEvent::Closed { .. }) => break,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} tunnel events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
