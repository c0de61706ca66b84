// Redis Tunnel - CLI Config Module
// Resolves the connection configuration from the config file and flags

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use redis_tunnel_core::{ConnectionConfig, Secret, SshAuth, SshTunnelConfig};

/// Connection settings given on the command line; they win over the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub database: Option<u32>,
    pub tls: bool,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_key: Option<PathBuf>,
}

/// Load `path` (or the default file when it exists), then apply overrides
pub fn resolve(path: Option<&Path>, overrides: Overrides) -> Result<ConnectionConfig> {
    let mut config = match path {
        Some(path) => ConnectionConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            let default_path =
                ConnectionConfig::default_path().context("Could not determine config directory")?;
            if default_path.exists() {
                ConnectionConfig::load(&default_path).with_context(|| {
                    format!("Failed to load configuration from {}", default_path.display())
                })?
            } else {
                ConnectionConfig::default()
            }
        }
    };

    apply(&mut config, overrides)?;
    config.validate().context("Invalid connection configuration")?;
    Ok(config)
}

fn apply(config: &mut ConnectionConfig, overrides: Overrides) -> Result<()> {
    if let Some(host) = overrides.host {
        config.host = host;
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(password) = overrides.password {
        config.password = Some(Secret::new(password));
    }
    if let Some(database) = overrides.database {
        config.database = database;
    }
    if overrides.tls {
        config.tls = true;
    }

    if let Some(ssh_host) = overrides.ssh_host {
        let user = overrides
            .ssh_user
            .or_else(|| config.ssh.as_ref().map(|ssh| ssh.user.clone()))
            .context("--ssh-host requires --ssh-user (or a user in the config file)")?;
        let auth = match overrides.ssh_key {
            Some(key_path) => SshAuth::Key {
                key_path,
                passphrase: None,
            },
            None => config
                .ssh
                .as_ref()
                .map(|ssh| ssh.auth.clone())
                .context("--ssh-host requires --ssh-key (or auth in the config file)")?,
        };
        config.ssh = Some(SshTunnelConfig::new(ssh_host, user, auth));
    }
    Ok(())
}
