// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Core Library
// RESP codec, transports (direct, TLS, SSH), pooling and reconnection

pub mod client;
pub mod connection;
pub mod known_hosts;
pub mod monitor;
pub mod pool;
pub mod reply;
pub mod resp;
pub mod supervisor;
pub mod tls;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use client::RedisClient;
pub use connection::{Connection, ConnectionFactory, ConnectionState, Handshake};
pub use monitor::{ReachabilityProbe, TcpProbe};
pub use pool::{ConnectionPool, LeasedConnection, PoolStats};
pub use reply::Reply;
pub use resp::{Command, Pipeline, RespCodec};
pub use supervisor::{StatusEmitter, Supervisor, SupervisorHandle};
pub use transport::{Connector, Transport, TransportFactory, TransportKind};
pub use tunnel::SshTunnel;

// Re-export the shared types so callers need only this crate
pub use redis_tunnel_common::{
    ConnectError, ConnectionConfig, ConnectionStatus, Error, HostKeyPolicy, PoolOptions,
    ProtocolError, ReconnectOptions, Result, Secret, SshAuth, SshTunnelConfig, StatusEvent,
    TransportError,
};
