// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Error types for Redis Tunnel

use std::time::Duration;

use thiserror::Error;

/// Failures while opening or using a byte-stream transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("SSH authentication failed: {0}")]
    Auth(String),

    #[error("Port forwarding failed: {0}")]
    Forward(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Host key verification failed: {0}")]
    HostKey(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// RESP framing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed reply: {0}")]
    Malformed(String),

    #[error("Unexpected end of stream while decoding reply")]
    UnexpectedEof,
}

/// Errors surfaced by connection, pool and client operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection is already serving another request")]
    ConnectionBusy,

    #[error("Connection is broken")]
    Broken,

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Error reply returned by the server, text verbatim
    #[error("{0}")]
    Server(String),

    #[error("Session handshake rejected: {0}")]
    Handshake(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a retry on a fresh connection may succeed.
    ///
    /// `Protocol` errors also break the connection but are not transient: a
    /// server sending unparseable replies will do so again, and the command
    /// may already have been applied.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Broken
                | Error::Transport(TransportError::Closed)
                | Error::Transport(TransportError::Timeout(_))
        )
    }

    /// Whether the failure happened below the RESP layer (socket, tunnel, TLS)
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_) | Error::Broken)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(TransportError::from(err))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => TransportError::Closed,
            _ => TransportError::Connect(err.to_string()),
        }
    }
}

/// Reason a `connect()` call failed, kept specific for the presentation layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error("Session handshake rejected: {0}")]
    Handshake(String),

    #[error("Connection pool exhausted during health check")]
    PoolExhausted,

    #[error("Health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Client is already connected")]
    AlreadyConnected,
}

impl From<Error> for ConnectError {
    fn from(err: Error) -> Self {
        match err {
            Error::Transport(e) => ConnectError::Transport(e),
            Error::Protocol(e) => ConnectError::Protocol(e),
            Error::Handshake(msg) => ConnectError::Handshake(msg),
            Error::PoolExhausted => ConnectError::PoolExhausted,
            Error::Timeout(d) => ConnectError::Timeout(d),
            Error::Config(msg) => ConnectError::Config(msg),
            other => ConnectError::HealthCheck(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
