// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Common Library
// Shared configuration, status types and error taxonomy

pub mod config;
pub mod error;
pub mod network;
pub mod types;

pub use config::{
    config_dir, ConnectionConfig, PoolOptions, ReconnectOptions, Secret, SshAuth,
    SshTunnelConfig,
};
pub use error::{ConnectError, Error, ProtocolError, Result, TransportError};
pub use network::{format_host_port, is_loopback_address};
pub use types::{ConnectionStatus, HostKeyPolicy, StatusEvent};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
