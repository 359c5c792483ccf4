// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - Tunnel Library
// Local port-forward tunnels over SSH with reconnect and auto-close policies

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod known_hosts;
pub mod listeners;
pub mod manager;
pub mod ssh;

pub use channel::{ForwardStream, SecureChannel};
pub use endpoint::{InboundConnection, ListeningEndpoint};
pub use error::{ChannelError, ForwardError, TRANSIENT_MESSAGES};
pub use factory::{create_tunnel, create_tunnel_with};
pub use known_hosts::{KnownHosts, VerifyResult};
pub use listeners::{AutoCloseListener, CloseListeners, ConnectionCloseListener};
pub use manager::{ForwardStats, TunnelManager};
pub use ssh::SshChannelClient;
