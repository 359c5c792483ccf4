// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - SSH Channel Client
// russh session that authenticates once and opens direct-tcpip channels on demand

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use sshfwd_common::{format_host_port, AuthType, HostKeyPolicy, SshOptions};

use crate::channel::{ForwardStream, SecureChannel};
use crate::error::ChannelError;
use crate::known_hosts::{fingerprint, KnownHosts, VerifyResult};

/// SSH client handler: host key verification
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts_path: std::path::PathBuf,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::Off {
            warn!(
                "Host key checking disabled, accepting {} for {}:{}",
                fingerprint(server_public_key),
                self.host,
                self.port
            );
            return Ok(true);
        }

        let mut known_hosts = KnownHosts::load(&self.known_hosts_path).map_err(io_error)?;

        match known_hosts.verify(&self.host, self.port, server_public_key) {
            VerifyResult::Trusted => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            VerifyResult::Unknown if self.policy == HostKeyPolicy::AcceptNew => {
                known_hosts.add(&self.host, self.port, server_public_key);
                known_hosts.save().map_err(io_error)?;
                warn!(
                    "Permanently added {}:{} ({}) to {}",
                    self.host,
                    self.port,
                    fingerprint(server_public_key),
                    known_hosts.path().display()
                );
                Ok(true)
            }
            VerifyResult::Unknown => {
                error!(
                    "No host key known for {}:{} ({}); add it to {} or use host_key_policy = \"accept-new\"",
                    self.host,
                    self.port,
                    fingerprint(server_public_key),
                    known_hosts.path().display()
                );
                Ok(false)
            }
            VerifyResult::Mismatch {
                actual_fingerprint,
                line_number,
            } => {
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!    @");
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("Someone could be eavesdropping on you right now (man-in-the-middle attack)!");
                error!("It is also possible that the host key has just been changed.");
                error!("Host: {}:{}", self.host, self.port);
                error!("Offending fingerprint: {}", actual_fingerprint);
                error!(
                    "Remove line {} of {} to accept the new key.",
                    line_number,
                    known_hosts.path().display()
                );
                Ok(false)
            }
        }
    }
}

fn io_error(err: anyhow::Error) -> russh::Error {
    russh::Error::from(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}

/// Secure channel client backed by a russh session
pub struct SshChannelClient {
    options: SshOptions,
    session: RwLock<Option<Arc<Handle<ClientHandler>>>>,
}

impl SshChannelClient {
    /// Connect and authenticate
    pub async fn connect(options: SshOptions) -> Result<Self> {
        options.validate().context("Invalid SSH configuration")?;
        let session = establish_session(&options).await?;
        Ok(Self {
            options,
            session: RwLock::new(Some(Arc::new(session))),
        })
    }

    async fn current_session(&self) -> Option<Arc<Handle<ClientHandler>>> {
        self.session.read().await.clone()
    }
}

#[async_trait]
impl SecureChannel for SshChannelClient {
    async fn open_forward(
        &self,
        src_addr: &str,
        src_port: u16,
        dst_addr: &str,
        dst_port: u16,
    ) -> Result<Box<dyn ForwardStream>, ChannelError> {
        let session = self
            .current_session()
            .await
            .filter(|s| !s.is_closed())
            .ok_or(ChannelError::NotConnected)?;

        let channel = session
            .channel_open_direct_tcpip(dst_addr, dst_port.into(), src_addr, src_port.into())
            .await?;

        debug!("Opened direct-tcpip channel to {}:{}", dst_addr, dst_port);
        Ok(Box::new(channel.into_stream()))
    }

    async fn end(&self) {
        let Some(session) = self.session.write().await.take() else {
            return;
        };

        if let Err(e) = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Failed to disconnect gracefully: {}", e);
        }
        info!("SSH session to {}:{} ended", self.options.host, self.options.port);
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        let session = establish_session(&self.options)
            .await
            .map_err(|e| ChannelError::Connect(format!("{:#}", e)))?;

        let previous = self.session.write().await.replace(Arc::new(session));
        if let Some(previous) = previous {
            let _ = previous
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
        Ok(())
    }
}

/// Open the TCP connection, verify the host key and authenticate
async fn establish_session(options: &SshOptions) -> Result<Handle<ClientHandler>> {
    let mut cfg = Config::default();
    cfg.window_size = options.window_size;
    cfg.maximum_packet_size = options.max_packet_size;
    cfg.nodelay = true;
    if options.keepalive_interval > 0 {
        cfg.keepalive_interval = Some(Duration::from_secs(options.keepalive_interval));
        cfg.keepalive_max = options.keepalive_max;
    }
    let config = Arc::new(cfg);

    let handler = ClientHandler {
        host: options.host.clone(),
        port: options.port,
        policy: options.host_key_policy,
        known_hosts_path: options.known_hosts_path.clone(),
    };

    let addr = format_host_port(&options.host, options.port);
    let timeout = Duration::from_secs(options.connect_timeout);
    info!("Connecting to SSH server: {}", addr);

    let mut session = match tokio::time::timeout(timeout, client::connect(config, &addr, handler)).await
    {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => anyhow::bail!("Failed to connect to {}: {}", addr, e),
        Err(_) => anyhow::bail!("Connection to {} timed out after {:?}", addr, timeout),
    };

    authenticate(&mut session, options).await?;
    info!("SSH authentication successful for {}@{}", options.username, addr);

    Ok(session)
}

async fn authenticate(session: &mut Handle<ClientHandler>, options: &SshOptions) -> Result<()> {
    let user = options.username.as_str();

    let result = match options.auth {
        AuthType::Key => {
            let key_path = options
                .key_path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Key path not specified"))?;
            info!("Authenticating with key: {}", key_path.display());

            let key = load_key(key_path, options)?;
            let key_with_alg = PrivateKeyWithHashAlg::new(
                Arc::new(key),
                session.best_supported_rsa_hash().await?.flatten(),
            );
            session
                .authenticate_publickey(user, key_with_alg)
                .await
                .context("Public key authentication failed")?
        }
        AuthType::Password => {
            info!("Authenticating with password");
            let password = options
                .resolve_password()
                .ok_or_else(|| anyhow::anyhow!("No password configured (set ssh.password or SSHFWD_PASSWORD)"))?;
            session
                .authenticate_password(user, password.expose())
                .await
                .context("Password authentication failed")?
        }
    };

    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();
            let methods_str = if methods.is_empty() {
                "No authentication methods available".to_string()
            } else {
                format!("Server requires: {}", methods.join(", "))
            };

            let message = if partial_success {
                format!("Authentication partially successful. {} to complete authentication", methods_str)
            } else {
                format!("Authentication rejected. {}", methods_str)
            };
            error!("{}", message);
            anyhow::bail!(message)
        }
    }
}

fn load_key(key_path: &Path, options: &SshOptions) -> Result<russh::keys::PrivateKey> {
    match options.resolve_passphrase() {
        Some(passphrase) => load_secret_key(key_path, Some(passphrase.expose()))
            .with_context(|| format!("Failed to decrypt SSH key from {}", key_path.display())),
        None => load_secret_key(key_path, None).map_err(|e| {
            let err_str = e.to_string().to_lowercase();
            if err_str.contains("encrypted") || err_str.contains("passphrase") || err_str.contains("decrypt") {
                anyhow::anyhow!(
                    "SSH key {} is encrypted; set ssh.passphrase or SSHFWD_PASSPHRASE",
                    key_path.display()
                )
            } else {
                anyhow::anyhow!("Failed to load SSH key from {}: {}", key_path.display(), e)
            }
        }),
    }
}
