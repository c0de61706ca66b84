// Configuration structures for Redis Tunnel

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::network::format_host_port;
use crate::types::HostKeyPolicy;

/// A credential that is wiped on drop and never printed
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Redis endpoint configuration, immutable for the lifetime of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Redis server hostname or IP (resolved on the SSH host when tunneled)
    #[serde(default = "default_host")]
    pub host: String,
    /// Redis server port (default: 6379)
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// ACL username (Redis 6+); only sent together with a password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// AUTH password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,
    /// Logical database selected after connecting
    #[serde(default)]
    pub database: u32,
    /// Wrap the Redis connection in TLS
    #[serde(default)]
    pub tls: bool,
    /// Optional SHA-256 certificate fingerprint pin ("AA:BB:...")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_fingerprint: Option<String>,
    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// TCP / SSH connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Optional SSH tunnel to reach the Redis server through a jump host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshTunnelConfig>,
    #[serde(default)]
    pub pool: PoolOptions,
    #[serde(default)]
    pub reconnect: ReconnectOptions,
}

/// SSH authentication method, credentials already resolved by the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SshAuth {
    /// Password authentication
    Password { password: Secret },
    /// Private key authentication with an optional passphrase
    Key {
        key_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<Secret>,
    },
}

/// SSH tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    /// SSH server hostname or IP
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    pub user: String,
    pub auth: SshAuth,
    /// Local port to bind for the forward (0 = pick a free port)
    #[serde(default)]
    pub local_port: u16,
    /// Local bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Path to known_hosts file (default: <config_dir>/redis-tunnel/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// SSH keepalive interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    /// SSH window size in bytes
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    /// Maximum SSH packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

/// Connection pool bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum connections (idle + leased)
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Idle connections the sweep never closes
    #[serde(default)]
    pub min_idle: usize,
    /// Idle connections older than this are closed by the sweep
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How long acquire waits for a free slot
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Interval of the idle sweep (0 = disabled)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Reconnection backoff and reachability probing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectOptions {
    /// Attempts before giving up with `Failed` (at least 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor between attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the delay before jitter
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay, in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Interval between reachability probes
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Timeout of a single probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_keepalive() -> u64 {
    30
}

fn default_window_size() -> u32 {
    2097152 // 2 MiB
}

fn default_max_packet_size() -> u32 {
    65535
}

fn default_max_size() -> usize {
    8
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_probe_interval_ms() -> u64 {
    2_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            min_idle: 0,
            idle_timeout_secs: default_idle_timeout_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl PoolOptions {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ReconnectOptions {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Delay before `attempt` (1-based) without jitter.
    /// The first attempt runs immediately.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.max(1.0).powi((attempt - 2) as i32);
        let millis = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_redis_port(),
            username: None,
            password: None,
            database: 0,
            tls: false,
            tls_fingerprint: None,
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ssh: None,
            pool: PoolOptions::default(),
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl SshTunnelConfig {
    /// Create a tunnel config with default options
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            auth,
            local_port: 0,
            bind_address: default_bind_address(),
            known_hosts_path: None,
            host_key_policy: HostKeyPolicy::default(),
            keepalive_interval_secs: default_keepalive(),
            window_size: default_window_size(),
            max_packet_size: default_max_packet_size(),
        }
    }

    /// Address of the jump host in `host:port` form
    pub fn endpoint(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

impl ConnectionConfig {
    /// Create a direct TCP configuration with default options
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Redis endpoint in `host:port` form
    pub fn endpoint(&self) -> String {
        format_host_port(&self.host, self.port)
    }

    /// First network hop: the SSH jump host when tunneled, otherwise Redis
    pub fn first_hop(&self) -> (String, u16) {
        match &self.ssh {
            Some(ssh) => (ssh.host.clone(), ssh.port),
            None => (self.host.clone(), self.port),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("Host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("Port must be greater than 0".to_string()));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(Error::Config(
                "Username requires a password for AUTH".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(Error::Config("Command timeout must be greater than 0".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config("Connect timeout must be greater than 0".to_string()));
        }
        if self.tls_fingerprint.is_some() && !self.tls {
            return Err(Error::Config(
                "TLS fingerprint given but TLS is disabled".to_string(),
            ));
        }

        // Validate pool bounds
        if self.pool.max_size == 0 {
            return Err(Error::Config("Pool max size must be greater than 0".to_string()));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(Error::Config(
                "Pool min idle cannot exceed max size".to_string(),
            ));
        }

        // Validate backoff
        if self.reconnect.max_attempts == 0 {
            return Err(Error::Config(
                "Reconnect attempts must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(Error::Config("Jitter must be between 0 and 1".to_string()));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(Error::Config("Backoff multiplier must be at least 1".to_string()));
        }
        if self.reconnect.probe_interval_ms == 0 {
            return Err(Error::Config("Probe interval must be greater than 0".to_string()));
        }
        if self.reconnect.probe_timeout_ms == 0 {
            return Err(Error::Config("Probe timeout must be greater than 0".to_string()));
        }

        // Validate tunnel
        if let Some(ssh) = &self.ssh {
            if ssh.host.is_empty() {
                return Err(Error::Config("SSH host cannot be empty".to_string()));
            }
            if ssh.user.is_empty() {
                return Err(Error::Config("SSH user cannot be empty".to_string()));
            }
            if ssh.port == 0 {
                return Err(Error::Config("SSH port must be greater than 0".to_string()));
            }
            if let SshAuth::Key { key_path, .. } = &ssh.auth {
                if key_path.as_os_str().is_empty() {
                    return Err(Error::Config(
                        "Key path required for key authentication".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Parse and validate a TOML configuration
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(config_dir()?.join("config.toml"))
    }
}

/// Get the configuration directory: <config_dir>/redis-tunnel
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join("redis-tunnel"))
}
