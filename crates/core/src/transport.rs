// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Transport Module
// Byte streams to Redis: direct TCP, TLS, or through an SSH tunnel

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use redis_tunnel_common::{format_host_port, ConnectionConfig, TransportError};

use crate::tls;
use crate::tunnel::SshTunnel;

/// Anything a Redis connection can speak RESP over
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

/// How the bytes reach the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Tls,
    Tunnel,
    /// Injected stream (tests, custom connectors)
    Custom,
}

/// Liveness view shared between a transport and its owner
#[derive(Debug, Clone)]
pub struct TransportHealth {
    alive: Arc<AtomicBool>,
    tunnel: Option<Arc<SshTunnel>>,
}

impl TransportHealth {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && self.tunnel.as_ref().map_or(true, |t| t.is_alive())
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// An open, ordered, bidirectional byte stream.
///
/// Reads hitting EOF and I/O errors mark the transport dead. There are no
/// retries at this layer.
pub struct Transport {
    stream: Box<dyn Stream>,
    kind: TransportKind,
    peer: String,
    health: TransportHealth,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Transport {
    pub fn new(stream: impl Stream, kind: TransportKind, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            kind,
            peer: peer.into(),
            health: TransportHealth {
                alive: Arc::new(AtomicBool::new(true)),
                tunnel: None,
            },
        }
    }

    /// Keep `tunnel` up for as long as this transport exists
    pub fn through_tunnel(mut self, tunnel: Arc<SshTunnel>) -> Self {
        self.health.tunnel = Some(tunnel);
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn health(&self) -> TransportHealth {
        self.health.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Shut down the write half and mark the transport dead
    pub async fn close(&mut self) {
        self.health.mark_dead();
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of transport to {} failed: {}", self.peer, e);
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let wants_data = buf.remaining() > 0;
        let poll = Pin::new(&mut self.stream).poll_read(cx, buf);
        match &poll {
            Poll::Ready(Ok(())) if wants_data && buf.filled().len() == before => {
                self.health.mark_dead()
            }
            Poll::Ready(Err(_)) => self.health.mark_dead(),
            _ => {}
        }
        poll
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.stream).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &poll {
            self.health.mark_dead();
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.stream).poll_flush(cx);
        if let Poll::Ready(Err(_)) = &poll {
            self.health.mark_dead();
        }
        poll
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Opens transports to one Redis endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh transport
    async fn open(&self) -> Result<Transport, TransportError>;

    /// Redis endpoint in `host:port` form
    fn endpoint(&self) -> String;

    /// Release shared resources such as an SSH session
    async fn close(&self) {}
}

/// Connector built from a `ConnectionConfig`.
///
/// With an SSH section, one tunnel is shared by every transport and is
/// re-established on the next `open()` once it dies.
pub struct TransportFactory {
    config: Arc<ConnectionConfig>,
    tunnel: Mutex<Option<Arc<SshTunnel>>>,
}

impl TransportFactory {
    pub fn new(config: Arc<ConnectionConfig>) -> Self {
        Self {
            config,
            tunnel: Mutex::new(None),
        }
    }

    async fn tunnel(&self) -> Result<Option<Arc<SshTunnel>>, TransportError> {
        let Some(ssh) = &self.config.ssh else {
            return Ok(None);
        };

        let mut guard = self.tunnel.lock().await;
        if let Some(tunnel) = guard.as_ref() {
            if tunnel.is_alive() {
                return Ok(Some(tunnel.clone()));
            }
        }
        if let Some(dead) = guard.take() {
            info!("Tunnel via {} is down, re-establishing", dead.endpoint());
            dead.close().await;
        }

        let tunnel = SshTunnel::open(
            ssh,
            &self.config.host,
            self.config.port,
            self.config.connect_timeout(),
        )
        .await?;
        *guard = Some(tunnel.clone());
        Ok(Some(tunnel))
    }
}

#[async_trait]
impl Connector for TransportFactory {
    async fn open(&self) -> Result<Transport, TransportError> {
        let endpoint = self.config.endpoint();
        let connect_timeout = self.config.connect_timeout();

        let (stream, kind, tunnel) = match self.tunnel().await? {
            Some(tunnel) => {
                let stream = tokio::time::timeout(connect_timeout, tunnel.connect_local())
                    .await
                    .map_err(|_| TransportError::Timeout(connect_timeout))??;
                (stream, TransportKind::Tunnel, Some(tunnel))
            }
            None => {
                let stream = connect_tcp(&self.config.host, self.config.port, connect_timeout).await?;
                (stream, TransportKind::Direct, None)
            }
        };

        let transport = if self.config.tls {
            let tls_stream = tokio::time::timeout(
                connect_timeout,
                tls::wrap(stream, &self.config.host, self.config.tls_fingerprint.as_deref()),
            )
            .await
            .map_err(|_| TransportError::Timeout(connect_timeout))??;
            Transport::new(tls_stream, TransportKind::Tls, endpoint)
        } else {
            Transport::new(stream, kind, endpoint)
        };

        debug!("Opened {:?} transport to {}", transport.kind(), transport.peer());
        Ok(match tunnel {
            Some(tunnel) => transport.through_tunnel(tunnel),
            None => transport,
        })
    }

    fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    async fn close(&self) {
        let tunnel = self.tunnel.lock().await.take();
        if let Some(tunnel) = tunnel {
            tunnel.close().await;
        }
    }
}

/// TCP connect with a deadline; no retries
pub async fn connect_tcp(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(TransportError::Connect(format!(
                "{}: {}",
                format_host_port(host, port),
                e
            )))
        }
        Err(_) => return Err(TransportError::Timeout(connect_timeout)),
    };
    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    Ok(stream)
}
