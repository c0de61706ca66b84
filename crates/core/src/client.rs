// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Client Module
// Facade: connect, execute, pipeline, disconnect, status events

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use redis_tunnel_common::{
    ConnectError, ConnectionConfig, ConnectionStatus, Error, Result, StatusEvent,
    TransportError, Uuid,
};

use crate::connection::{ConnectionFactory, Handshake};
use crate::monitor::{ReachabilityProbe, TcpProbe};
use crate::pool::{ConnectionPool, PoolStats};
use crate::reply::Reply;
use crate::resp::{Command, Pipeline};
use crate::supervisor::{StatusEmitter, Supervisor, SupervisorHandle};
use crate::transport::{Connector, TransportFactory};

/// Status event channel capacity; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Everything created by one successful `connect()`
struct Session {
    id: Uuid,
    config: Arc<ConnectionConfig>,
    pool: ConnectionPool,
    connector: Arc<dyn Connector>,
    supervisor: SupervisorHandle,
    emitter: StatusEmitter,
}

impl Session {
    /// Lease, run, release. The lease is healthy only if the exchange succeeded.
    async fn attempt(&self, commands: &[Command]) -> Result<Vec<Reply>> {
        let lease = self.pool.acquire(self.config.pool.acquire_timeout()).await?;
        let result = lease
            .execute_pipeline(commands, self.config.command_timeout())
            .await;
        self.pool.release(lease, result.is_ok());
        result
    }

    /// Run with one transparent retry on a fresh connection for transient errors
    async fn dispatch(&self, commands: &[Command]) -> Result<Vec<Reply>> {
        let err = match self.attempt(commands).await {
            Ok(replies) => return Ok(replies),
            Err(e) => e,
        };

        if !err.is_transient() {
            if err.is_link_failure() {
                self.supervisor.report_link_failure(err.to_string());
            }
            return Err(err);
        }

        debug!("Retrying on a fresh connection after: {}", err);
        if err == Error::Transport(TransportError::Closed) {
            // Idle siblings share the peer that just went away.
            self.pool.evict_idle().await;
        }

        match self.attempt(commands).await {
            Err(retry_err) if retry_err.is_link_failure() => {
                warn!("Retry failed: {}", retry_err);
                self.supervisor.report_link_failure(retry_err.to_string());
                Err(retry_err)
            }
            other => other,
        }
    }

    async fn shutdown(&self) {
        self.supervisor.stop().await;
        self.pool.shutdown().await;
        self.connector.close().await;
        info!("Session {} to {} closed", self.id, self.connector.endpoint());
    }
}

/// Async Redis client with pooling, optional SSH tunneling and automatic
/// reconnection.
///
/// One client serves one endpoint at a time. It is safe to share between
/// tasks; all methods take `&self`.
pub struct RedisClient {
    events: broadcast::Sender<StatusEvent>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    session: RwLock<Option<Arc<Session>>>,
    /// Serializes connect/disconnect
    lifecycle: Mutex<()>,
}

impl Default for RedisClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RedisClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            events,
            status: Arc::new(status),
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Receive every status transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Latest status, as a watch channel
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Validate `config`, open the first connection and start supervising it
    pub async fn connect(&self, config: ConnectionConfig) -> std::result::Result<(), ConnectError> {
        config.validate()?;
        let config = Arc::new(config);
        let connector = Arc::new(TransportFactory::new(config.clone()));
        let probe = Arc::new(TcpProbe::from_config(&config));
        self.connect_with(config, connector, probe).await
    }

    /// `connect` with an explicit connector and reachability probe
    pub async fn connect_with(
        &self,
        config: Arc<ConnectionConfig>,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> std::result::Result<(), ConnectError> {
        config.validate()?;
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(existing) = self.current_session().await {
            if !self.status().is_failed() {
                return Err(ConnectError::AlreadyConnected);
            }
            info!("Replacing failed session {}", existing.id);
            self.session.write().await.take();
            existing.shutdown().await;
        }

        let session_id = Uuid::new_v4();
        let endpoint = connector.endpoint();
        info!("Connecting to {} (session {})", endpoint, session_id);

        // Health check before any pool exists: a failed connect leaves nothing behind.
        let factory = ConnectionFactory::new(connector.clone(), Handshake::from_config(&config));
        let first = match factory.create().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Connection to {} failed: {}", endpoint, e);
                connector.close().await;
                return Err(e.into());
            }
        };
        if let Err(e) = first.ping(config.command_timeout()).await {
            warn!("Health check against {} failed: {}", endpoint, e);
            first.close().await;
            connector.close().await;
            return Err(e.into());
        }

        let pool = ConnectionPool::new(factory, config.pool.clone());
        pool.seed(first)?;

        let emitter = StatusEmitter::new(
            self.events.clone(),
            self.status.clone(),
            session_id,
            endpoint.clone(),
        );
        let supervisor = Supervisor::new(
            pool.clone(),
            probe,
            emitter.clone(),
            config.reconnect.clone(),
            config.pool.acquire_timeout(),
            config.command_timeout(),
        )
        .spawn();

        *self.session.write().await = Some(Arc::new(Session {
            id: session_id,
            config,
            pool,
            connector,
            supervisor,
            emitter: emitter.clone(),
        }));

        info!("Connected to {}", endpoint);
        emitter.emit(ConnectionStatus::Connected);
        Ok(())
    }

    /// Run one command and return its reply.
    ///
    /// Server error replies come back as `Reply::Error`; use
    /// `Reply::into_result` to turn them into `Error::Server`.
    pub async fn execute(&self, command: &Command) -> Result<Reply> {
        let session = self.require_session().await?;
        let mut replies = session.dispatch(std::slice::from_ref(command)).await?;
        replies
            .pop()
            .ok_or_else(|| Error::UnexpectedReply("no reply received".to_string()))
    }

    /// Send all commands on one connection; replies come back in order
    pub async fn execute_pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.require_session().await?;
        session.dispatch(commands).await
    }

    pub async fn execute_batch(&self, pipeline: &Pipeline) -> Result<Vec<Reply>> {
        self.execute_pipeline(pipeline.commands()).await
    }

    /// Stop supervision, close every connection and the tunnel
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(session) = self.session.write().await.take() else {
            debug!("Disconnect without an active session");
            return;
        };
        session.shutdown().await;
        session.emitter.emit(ConnectionStatus::Disconnected);
    }

    /// Pool counters of the active session
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.current_session().await.map(|s| s.pool.stats())
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.current_session().await.map(|s| s.id)
    }

    async fn current_session(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    async fn require_session(&self) -> Result<Arc<Session>> {
        self.current_session().await.ok_or(Error::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockServer};
    use async_trait::async_trait;
    use bytes::Bytes;
    use redis_tunnel_common::ProtocolError;
    use std::time::Duration;

    struct AlwaysUp;

    #[async_trait]
    impl ReachabilityProbe for AlwaysUp {
        async fn probe(&self) -> bool {
            true
        }
    }

    fn config() -> Arc<ConnectionConfig> {
        let mut config = ConnectionConfig::new("mock", 6379);
        config.command_timeout_ms = 200;
        config.pool.sweep_interval_secs = 0;
        config.reconnect.probe_interval_ms = 20;
        config.reconnect.base_delay_ms = 5;
        config.reconnect.jitter = 0.0;
        Arc::new(config)
    }

    async fn connected(server: &MockServer) -> (RedisClient, Arc<MockConnector>) {
        let client = RedisClient::new();
        let connector = Arc::new(MockConnector::new(server.clone()));
        client
            .connect_with(config(), connector.clone(), Arc::new(AlwaysUp))
            .await
            .unwrap();
        (client, connector)
    }

    #[tokio::test]
    async fn test_not_connected_before_connect() {
        let client = RedisClient::new();
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            client.execute(&Command::new("PING")).await.unwrap_err(),
            Error::NotConnected
        );
        assert!(client.pool_stats().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_emits_connected_once() {
        let server = MockServer::new();
        let client = RedisClient::new();
        let mut events = client.subscribe();

        client
            .connect_with(config(), Arc::new(MockConnector::new(server)), Arc::new(AlwaysUp))
            .await
            .unwrap();
        assert!(client.is_connected());

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, ConnectionStatus::Connected);
        assert_eq!(event.endpoint, "mock:6379");
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        // The health-check connection is kept for reuse.
        assert_eq!(client.pool_stats().await.unwrap().idle, 1);
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let server = MockServer::new();
        let (client, _connector) = connected(&server).await;
        let err = client
            .connect_with(config(), Arc::new(MockConnector::new(server)), Arc::new(AlwaysUp))
            .await
            .unwrap_err();
        assert_eq!(err, ConnectError::AlreadyConnected);
    }

    #[tokio::test]
    async fn test_pipeline_set_get() {
        let server = MockServer::new();
        let (client, _connector) = connected(&server).await;

        let mut pipeline = Pipeline::new();
        pipeline.push(Command::new("SET").arg("greeting").arg("hello"));
        pipeline.push(Command::new("GET").arg("greeting"));
        let replies = client.execute_batch(&pipeline).await.unwrap();
        assert_eq!(
            replies,
            vec![
                Reply::SimpleString("OK".into()),
                Reply::BulkString(Bytes::from("hello"))
            ]
        );
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockServer::new();
        let (client, connector) = connected(&server).await;

        let reply = client.execute(&Command::new("NOPE")).await.unwrap();
        assert!(matches!(reply.into_result(), Err(Error::Server(msg)) if msg.starts_with("ERR unknown")));
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_not_retried() {
        let server = MockServer::new();
        let (client, connector) = connected(&server).await;

        let err = client.execute(&Command::new("GARBAGE")).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Malformed(_))), "got {:?}", err);
        assert_eq!(connector.opened(), 1);
        let garbage_sent = server
            .commands()
            .iter()
            .filter(|words| words[0] == "GARBAGE")
            .count();
        assert_eq!(garbage_sent, 1);

        // The broken connection was evicted; the next command gets a fresh one.
        assert_eq!(client.pool_stats().await.unwrap().total, 0);
        assert!(client.execute(&Command::new("PING")).await.is_ok());
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn test_peer_close_is_retried_transparently() {
        let server = MockServer::new();
        let (client, connector) = connected(&server).await;

        // The pooled connection's peer goes away before the next command.
        server.kill_all();
        let reply = client
            .execute(&Command::new("ECHO").arg("still here"))
            .await
            .unwrap();
        assert_eq!(reply, Reply::BulkString(Bytes::from("still here")));
        assert_eq!(connector.opened(), 2);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_failed_retry_reports_link_failure() {
        let server = MockServer::new();
        let (client, connector) = connected(&server).await;
        let mut events = client.subscribe();

        server.kill_all();
        connector.set_refusing(true);
        let err = client.execute(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Connect(_))));

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, ConnectionStatus::Disconnected);

        // Once the endpoint accepts again, the supervisor brings the session back.
        connector.set_refusing(false);
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event.status == ConnectionStatus::Connected {
                break;
            }
            assert_eq!(event.status, ConnectionStatus::Reconnecting);
        }
        assert!(client.execute(&Command::new("PING")).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_nothing_behind() {
        let connector = Arc::new(MockConnector::new(MockServer::new()));
        connector.set_refusing(true);
        let client = RedisClient::new();

        let err = client
            .connect_with(config(), connector, Arc::new(AlwaysUp))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Transport(TransportError::Connect(_))));
        assert!(client.pool_stats().await.is_none());
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_password_is_handshake_error() {
        let mut config = (*config()).clone();
        config.password = Some(redis_tunnel_common::Secret::new("nope"));
        let client = RedisClient::new();

        let err = client
            .connect_with(
                Arc::new(config),
                Arc::new(MockConnector::new(MockServer::with_password("right"))),
                Arc::new(AlwaysUp),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Handshake(msg) if msg.starts_with("WRONGPASS")));
    }

    #[tokio::test]
    async fn test_disconnect_closes_everything() {
        let server = MockServer::new();
        let (client, _connector) = connected(&server).await;
        let mut events = client.subscribe();

        client.disconnect().await;
        assert_eq!(events.recv().await.unwrap().status, ConnectionStatus::Disconnected);
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            client.execute(&Command::new("PING")).await.unwrap_err(),
            Error::NotConnected
        );

        // A second disconnect is a no-op.
        client.disconnect().await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_the_pool() {
        let server = MockServer::new();
        let (client, _connector) = connected(&server).await;
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let key = format!("key:{}", i);
                client
                    .execute(&Command::new("SET").arg(&key).arg_int(i))
                    .await?;
                client.execute(&Command::new("GET").arg(&key)).await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let value = task.await.unwrap().unwrap().into_integer().unwrap();
            assert_eq!(value, i as i64);
        }

        let stats = client.pool_stats().await.unwrap();
        assert!(stats.total <= stats.max_size);
        assert_eq!(stats.leased, 0);
    }
}
