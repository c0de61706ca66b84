// Redis Tunnel - Monitor Module
// Reachability probes for the first network hop

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

use redis_tunnel_common::{format_host_port, ConnectionConfig};

/// Answers "can the first hop be reached right now?"
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    async fn probe(&self) -> bool;
}

/// TCP connect probe against the jump host, or the Redis host when direct
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        let (host, port) = config.first_hop();
        Self::new(host, port, config.reconnect.probe_timeout())
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let reachable = matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)));
        trace!(
            "Probe {} -> {}",
            format_host_port(&self.host, self.port),
            if reachable { "reachable" } else { "unreachable" }
        );
        reachable
    }
}
