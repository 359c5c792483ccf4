// Configuration structures for sshfwd

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::types::{AuthType, HostKeyPolicy};

/// Complete tunnel configuration, as stored in `tunnel.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub tunnel: TunnelOptions,
    #[serde(default)]
    pub server: ServerOptions,
    #[serde(default)]
    pub ssh: SshOptions,
    #[serde(default)]
    pub forward: ForwardOptions,
}

/// Tunnel lifecycle behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Close the tunnel once the last forwarded connection ends
    #[serde(default)]
    pub auto_close: bool,
    /// Run a reconnect cycle when opening a forwarded channel fails transiently
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Reconnect cycles allowed per forwarded connection
    #[serde(default = "default_reconnect_count")]
    pub auto_reconnect_count: u32,
    /// Pause between ending the SSH session and reconnecting, in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Local listening endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Local bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_host")]
    pub host: String,
    /// Local port to bind (0 = pick an ephemeral port)
    #[serde(default)]
    pub port: u16,
}

/// Password or passphrase, wiped from memory on drop
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

// Secrets never reach logs
impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshOptions {
    /// SSH server hostname or IP
    #[serde(default)]
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    #[serde(default)]
    pub username: String,
    /// Authentication type
    #[serde(default = "default_auth_type")]
    pub auth: AuthType,
    /// Path to SSH private key (for key auth)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    /// Private key passphrase; SSHFWD_PASSPHRASE is used when unset
    #[serde(default, skip_serializing)]
    pub passphrase: Option<SecretString>,
    /// SSH password; SSHFWD_PASSWORD is used when unset
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    /// Path to the known_hosts file used for host key verification
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,
    /// What to do with unknown host keys
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Keepalive interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u64,
    /// Unanswered keepalives before the session is considered dead
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,
    /// SSH window size in bytes
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    /// Maximum SSH packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// TCP connect + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

/// Addresses handed to the SSH server for every forwarded channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardOptions {
    /// Originator address reported to the SSH server
    #[serde(default = "default_bind_host")]
    pub src_addr: String,
    /// Originator port reported to the SSH server
    #[serde(default)]
    pub src_port: u16,
    /// Destination host, resolved by the SSH server
    #[serde(default)]
    pub dst_addr: String,
    /// Destination port
    #[serde(default)]
    pub dst_port: u16,
}

// Default value functions
fn default_reconnect_count() -> u32 {
    3
}

fn default_reconnect_delay_ms() -> u64 {
    100
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_auth_type() -> AuthType {
    AuthType::Key
}

fn default_known_hosts_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshfwd")
        .join("known_hosts")
}

fn default_keepalive() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_window_size() -> u32 {
    2097152 // 2 MiB
}

fn default_max_packet_size() -> u32 {
    65535
}

fn default_connect_timeout() -> u64 {
    15
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            auto_close: false,
            auto_reconnect: false,
            auto_reconnect_count: default_reconnect_count(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: 0,
        }
    }
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            auth: default_auth_type(),
            key_path: None,
            passphrase: None,
            password: None,
            known_hosts_path: default_known_hosts_path(),
            host_key_policy: HostKeyPolicy::default(),
            keepalive_interval: default_keepalive(),
            keepalive_max: default_keepalive_max(),
            window_size: default_window_size(),
            max_packet_size: default_max_packet_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            src_addr: default_bind_host(),
            src_port: 0,
            dst_addr: "localhost".to_string(),
            dst_port: 0,
        }
    }
}

impl TunnelConfig {
    /// Load a tunnel configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a tunnel configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Default location of the tunnel configuration: ~/.config/sshfwd/tunnel.toml
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join("sshfwd").join("tunnel.toml"))
    }

    /// Validate the complete configuration
    pub fn validate(&self) -> Result<()> {
        self.ssh.validate()?;

        if self.forward.dst_addr.is_empty() {
            return Err(Error::Config("Forward destination host cannot be empty".to_string()));
        }
        if self.forward.dst_port == 0 {
            return Err(Error::Config(
                "Forward destination port must be greater than 0".to_string(),
            ));
        }
        if self.server.host.is_empty() {
            return Err(Error::Config("Bind address cannot be empty".to_string()));
        }
        if self.tunnel.auto_reconnect && self.tunnel.auto_reconnect_count == 0 {
            tracing::warn!("auto_reconnect is enabled but auto_reconnect_count is 0; no reconnect cycle will run");
        }

        Ok(())
    }
}

impl SshOptions {
    /// Validate the SSH connection settings
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("SSH host cannot be empty".to_string()));
        }
        if self.username.is_empty() {
            return Err(Error::Config("SSH username cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("SSH port must be greater than 0".to_string()));
        }
        if self.auth == AuthType::Key && self.key_path.is_none() {
            return Err(Error::Config(
                "Key path required for key authentication".to_string(),
            ));
        }
        Ok(())
    }

    /// Password from the config, falling back to SSHFWD_PASSWORD
    pub fn resolve_password(&self) -> Option<SecretString> {
        self.password
            .clone()
            .or_else(|| std::env::var("SSHFWD_PASSWORD").ok().map(SecretString::new))
    }

    /// Key passphrase from the config, falling back to SSHFWD_PASSPHRASE
    pub fn resolve_passphrase(&self) -> Option<SecretString> {
        self.passphrase
            .clone()
            .or_else(|| std::env::var("SSHFWD_PASSPHRASE").ok().map(SecretString::new))
    }

    /// Apply a `[user@]host[:port]` destination string
    pub fn apply_destination(&mut self, destination: &str) -> Result<()> {
        let (user, host_port) = match destination.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user), rest),
            Some(_) => {
                return Err(Error::Destination(format!("empty user in '{}'", destination)))
            }
            None => (None, destination),
        };

        let (host, port) = split_host_port(host_port)
            .ok_or_else(|| Error::Destination(format!("cannot parse '{}'", destination)))?;

        if let Some(user) = user {
            self.username = user.to_string();
        }
        self.host = host;
        if let Some(port) = port {
            self.port = port;
        }
        Ok(())
    }
}

/// Parse an `ssh -L` style specification: `[bind_address:]port:host:hostport`
pub fn parse_local_forward(spec: &str) -> Result<(ServerOptions, ForwardOptions)> {
    let parts = split_forward_spec(spec);
    let invalid = |why: &str| Error::ForwardSpec(format!("'{}': {}", spec, why));

    let (bind_host, bind_port, dst_addr, dst_port) = match parts.as_slice() {
        [port, host, host_port] => (default_bind_host(), *port, *host, *host_port),
        [bind, port, host, host_port] => (bind.to_string(), *port, *host, *host_port),
        _ => return Err(invalid("expected [bind_address:]port:host:hostport")),
    };

    let bind_port: u16 = bind_port.parse().map_err(|_| invalid("bad local port"))?;
    let dst_port: u16 = dst_port.parse().map_err(|_| invalid("bad destination port"))?;
    if dst_addr.is_empty() {
        return Err(invalid("empty destination host"));
    }

    Ok((
        ServerOptions {
            host: bind_host.clone(),
            port: bind_port,
        },
        ForwardOptions {
            src_addr: bind_host,
            src_port: bind_port,
            dst_addr: dst_addr.to_string(),
            dst_port,
        },
    ))
}

// Split on ':' while keeping bracketed IPv6 literals intact
fn split_forward_spec(spec: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut depth = 0;
    for (i, c) in spec.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ':' if depth == 0 => {
                parts.push(spec[start..i].trim_matches(['[', ']']));
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(spec[start..].trim_matches(['[', ']']));
    parts
}

fn split_host_port(value: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return Some((host.to_string(), port));
    }

    match value.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            Some((host.to_string(), Some(port.parse().ok()?)))
        }
        // Bare IPv6 literal without a port
        Some(_) => Some((value.to_string(), None)),
        None if value.is_empty() => None,
        None => Some((value.to_string(), None)),
    }
}
