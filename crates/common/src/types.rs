// Common types for sshfwd

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authentication type for SSH connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// SSH key authentication
    Key,
    /// Password authentication
    Password,
}

/// Handling of server host keys that are not yet in known_hosts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Unknown hosts are rejected
    #[default]
    Strict,
    /// Unknown host keys are recorded on first use
    AcceptNew,
    /// Any host key is accepted (testing only)
    Off,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" | "yes" => Ok(Self::Strict),
            "accept-new" => Ok(Self::AcceptNew),
            "off" | "no" => Ok(Self::Off),
            other => Err(format!(
                "unknown host key policy '{}' (expected strict, accept-new or off)",
                other
            )),
        }
    }
}

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Idle,           // listening, nothing in flight
    Connecting,     // opening a forwarded channel
    Forwarding,     // at least one pipe running
    ReconnectWait,  // reconnect cycle in progress
    Closed,         // close() was called
}

impl TunnelState {
    /// Check if the state is terminal
    pub fn is_closed(&self) -> bool {
        matches!(self, TunnelState::Closed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::Forwarding => "forwarding",
            TunnelState::ReconnectWait => "reconnect-wait",
            TunnelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events emitted by a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// A forwarded channel was opened for an inbound connection
    Forwarding {
        peer: SocketAddr,
        timestamp: DateTime<Utc>,
    },

    /// An inbound connection closed
    ConnectionClosed {
        peer: SocketAddr,
        bytes_sent: u64,
        bytes_received: u64,
        timestamp: DateTime<Utc>,
    },

    /// A reconnect cycle started
    Reconnecting {
        attempt: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A reconnect cycle finished
    Reconnected {
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// Tunnel closed
    Closed { timestamp: DateTime<Utc> },
}
