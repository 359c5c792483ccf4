// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - Common Library
// Shared configuration structures, error and event types

pub mod config;
pub mod error;
pub mod network;
pub mod types;

pub use config::{
    parse_local_forward, ForwardOptions, SecretString, ServerOptions, SshOptions, TunnelConfig,
    TunnelOptions,
};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address};
pub use types::{AuthType, HostKeyPolicy, TunnelEvent, TunnelState};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
