// Common types for Redis Tunnel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of the connection to one Redis endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,      // health-checked connection available
    Disconnected,   // link lost or intentionally closed
    Reconnecting,   // supervisor is draining and re-acquiring
    Failed(String), // retry budget exhausted (reason)
}

impl ConnectionStatus {
    /// Check if the status represents a usable connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Check if the status is terminal until the caller connects again
    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionStatus::Failed(_))
    }
}

/// Event broadcast to subscribers on every status transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Session this event belongs to (one per `connect()` call)
    pub session_id: Uuid,
    /// Endpoint in `host:port` form
    pub endpoint: String,
    pub status: ConnectionStatus,
    /// Reconnection attempt number, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(session_id: Uuid, endpoint: &str, status: ConnectionStatus) -> Self {
        Self {
            session_id,
            endpoint: endpoint.to_string(),
            status,
            attempt: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// What to do with SSH host keys that are not yet in known_hosts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Reject hosts that are not already trusted
    Strict,
    /// Trust and record unknown hosts on first use, reject mismatches
    #[default]
    AcceptNew,
    /// Skip verification entirely (test environments only)
    AcceptAny,
}
