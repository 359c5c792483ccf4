// sshfwd - CLI Config Module
// Loads the tunnel configuration file and applies command-line overrides

use std::path::Path;

use anyhow::{Context, Result};

use sshfwd_common::{parse_local_forward, AuthType, TunnelConfig};

use crate::Cli;

/// Load the config file named on the command line, or the default one if present
pub fn load(explicit: Option<&Path>) -> Result<TunnelConfig> {
    if let Some(path) = explicit {
        return TunnelConfig::load(path)
            .with_context(|| format!("Failed to load tunnel configuration {}", path.display()));
    }

    let default_path = TunnelConfig::default_path()?;
    if default_path.exists() {
        TunnelConfig::load(&default_path).with_context(|| {
            format!("Failed to load tunnel configuration {}", default_path.display())
        })
    } else {
        Ok(TunnelConfig::default())
    }
}

/// Final configuration: file values overridden by command-line flags
pub fn resolve(cli: &Cli) -> Result<TunnelConfig> {
    resolve_with(load(cli.config.as_deref())?, cli)
}

/// Apply command-line flags to an already loaded configuration and validate it
fn resolve_with(mut config: TunnelConfig, cli: &Cli) -> Result<TunnelConfig> {
    apply_overrides(&mut config, cli)?;

    if config.ssh.username.is_empty() {
        if let Ok(user) = std::env::var("USER") {
            config.ssh.username = user;
        }
    }

    config.validate().context("Invalid tunnel configuration")?;
    Ok(config)
}

fn apply_overrides(config: &mut TunnelConfig, cli: &Cli) -> Result<()> {
    if let Some(spec) = &cli.local_forward {
        let (server, forward) = parse_local_forward(spec)?;
        config.server = server;
        config.forward = forward;
    }

    if let Some(destination) = &cli.destination {
        config.ssh.apply_destination(destination)?;
    }
    if let Some(identity) = &cli.identity {
        config.ssh.auth = AuthType::Key;
        config.ssh.key_path = Some(identity.clone());
    }
    if cli.password_auth {
        config.ssh.auth = AuthType::Password;
    }
    if let Some(path) = &cli.known_hosts {
        config.ssh.known_hosts_path = path.clone();
    }
    if let Some(policy) = cli.host_key_policy {
        config.ssh.host_key_policy = policy;
    }

    config.tunnel.auto_close |= cli.auto_close;
    config.tunnel.auto_reconnect |= cli.auto_reconnect;
    if let Some(count) = cli.reconnect_count {
        config.tunnel.auto_reconnect_count = count;
    }
    if let Some(delay) = cli.reconnect_delay_ms {
        config.tunnel.reconnect_delay_ms = delay;
    }
    Ok(())
}
