// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Connection Module
// One RESP session over a transport: handshake, single-flight request/reply

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use redis_tunnel_common::{ConnectionConfig, Error, Result, Secret, TransportError};

use crate::reply::Reply;
use crate::resp::{Command, RespCodec};
use crate::transport::{Connector, Transport, TransportHealth};

/// Lifecycle of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Leased = 1,
    /// A request failed at the transport/protocol level; never reused
    Broken = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Leased,
            2 => ConnectionState::Broken,
            _ => ConnectionState::Closed,
        }
    }
}

/// A session with one Redis server.
///
/// At most one request is in flight at a time; a concurrent caller gets
/// `ConnectionBusy` instead of interleaving frames. Any transport or
/// protocol failure, timeout, or cancellation mid-exchange leaves the
/// connection `Broken`. Error replies from the server do not.
pub struct Connection {
    id: u64,
    io: tokio::sync::Mutex<Framed<Transport, RespCodec>>,
    state: AtomicU8,
    health: TransportHealth,
    created_at: Instant,
    last_used: Mutex<Instant>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks the connection broken unless the exchange ran to completion
struct ExchangeGuard<'a> {
    conn: &'a Connection,
    completed: bool,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.conn.mark_broken();
        }
    }
}

impl Connection {
    pub fn new(id: u64, transport: Transport) -> Self {
        let now = Instant::now();
        Self {
            id,
            health: transport.health(),
            io: tokio::sync::Mutex::new(Framed::new(transport, RespCodec)),
            state: AtomicU8::new(ConnectionState::Idle as u8),
            created_at: now,
            last_used: Mutex::new(now),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move between Idle and Leased; Broken and Closed are terminal
    pub(crate) fn set_state(&self, next: ConnectionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match ConnectionState::from_u8(current) {
                    ConnectionState::Broken | ConnectionState::Closed => None,
                    _ => Some(next as u8),
                }
            });
    }

    pub(crate) fn mark_broken(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (ConnectionState::from_u8(current) != ConnectionState::Closed)
                    .then_some(ConnectionState::Broken as u8)
            });
        self.health.mark_dead();
    }

    /// Usable for another request
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Idle | ConnectionState::Leased
        ) && self.health.is_alive()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Restart the idle clock
    pub(crate) fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Send one command and wait for its reply
    pub async fn execute(&self, command: &Command, timeout: Duration) -> Result<Reply> {
        let mut replies = self
            .execute_pipeline(std::slice::from_ref(command), timeout)
            .await?;
        replies
            .pop()
            .ok_or_else(|| Error::UnexpectedReply("no reply received".to_string()))
    }

    /// Write every command, then read exactly one reply per command in order.
    ///
    /// `timeout` bounds the whole exchange.
    pub async fn execute_pipeline(
        &self,
        commands: &[Command],
        timeout: Duration,
    ) -> Result<Vec<Reply>> {
        match self.state() {
            ConnectionState::Broken => return Err(Error::Broken),
            ConnectionState::Closed => return Err(Error::Transport(TransportError::Closed)),
            _ => {}
        }
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut io = self.io.try_lock().map_err(|_| Error::ConnectionBusy)?;
        let mut guard = ExchangeGuard {
            conn: self,
            completed: false,
        };

        let result = match tokio::time::timeout(timeout, exchange(&mut io, commands)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        };

        match &result {
            Ok(_) => {
                guard.completed = true;
                self.touch();
            }
            Err(e) => debug!("Connection {} broken: {}", self.id, e),
        }
        result
    }

    /// PING round trip
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        match self.execute(&Command::new("PING"), timeout).await?.into_result()? {
            Reply::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(Error::UnexpectedReply(format!(
                "expected PONG, got {}",
                other.kind()
            ))),
        }
    }

    /// Close the transport; the connection can no longer be used
    pub async fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.health.mark_dead();
        match self.io.try_lock() {
            Ok(mut io) => io.get_mut().close().await,
            // An exchange still owns the stream; dropping the connection closes it.
            Err(_) => debug!("Connection {} closed while busy", self.id),
        }
    }
}

async fn exchange(
    io: &mut Framed<Transport, RespCodec>,
    commands: &[Command],
) -> Result<Vec<Reply>> {
    for command in commands {
        io.feed(command).await?;
    }
    io.flush().await?;

    let mut replies = Vec::with_capacity(commands.len());
    while replies.len() < commands.len() {
        match io.next().await {
            Some(reply) => replies.push(reply?),
            None => return Err(Error::Transport(TransportError::Closed)),
        }
    }
    Ok(replies)
}

/// Session setup applied to every new connection
#[derive(Debug, Clone)]
pub struct Handshake {
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub database: u32,
    pub timeout: Duration,
}

impl Handshake {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            database: config.database,
            timeout: config.command_timeout(),
        }
    }

    /// AUTH then SELECT; an error reply from either is a `Handshake` error
    async fn run(&self, conn: &Connection) -> Result<()> {
        if let Some(password) = &self.password {
            let mut auth = Command::new("AUTH");
            if let Some(username) = &self.username {
                auth = auth.arg(username);
            }
            let auth = auth.arg(password.expose());
            expect_ok(conn.execute(&auth, self.timeout).await?, "AUTH")?;
        }
        if self.database != 0 {
            let select = Command::new("SELECT").arg_int(self.database.into());
            expect_ok(conn.execute(&select, self.timeout).await?, "SELECT")?;
        }
        Ok(())
    }
}

fn expect_ok(reply: Reply, step: &str) -> Result<()> {
    match reply {
        Reply::Error(msg) => Err(Error::Handshake(msg)),
        reply if reply.is_ok() => Ok(()),
        other => Err(Error::Handshake(format!(
            "{} returned {}",
            step,
            other.kind()
        ))),
    }
}

/// Opens transports and runs the handshake, yielding ready connections
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    handshake: Handshake,
    next_id: AtomicU64,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, handshake: Handshake) -> Self {
        Self {
            connector,
            handshake,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Open a transport and bring up a session on it
    pub async fn create(&self) -> Result<Connection> {
        let transport = self.connector.open().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(id, transport);

        if let Err(e) = self.handshake.run(&conn).await {
            warn!(
                "Handshake with {} failed: {}",
                self.connector.endpoint(),
                e
            );
            conn.close().await;
            return Err(e);
        }
        debug!("Connection {} ready to {}", id, self.connector.endpoint());
        Ok(conn)
    }
}
