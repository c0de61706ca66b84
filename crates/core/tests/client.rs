// End-to-end client scenarios against an in-process RESP server over TCP

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{self, Auth};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use redis_tunnel_core::resp::decode;
use redis_tunnel_core::{
    Command, ConnectError, ConnectionConfig, ConnectionStatus, HostKeyPolicy, RedisClient, Reply,
    Secret, SshAuth, SshTunnelConfig, TransportError,
};

#[derive(Default)]
struct ServerState {
    data: Mutex<HashMap<Bytes, Bytes>>,
    connections: AtomicUsize,
    /// Close the connection instead of answering the next command
    drop_next: AtomicBool,
}

struct MockRedis {
    port: u16,
    state: Arc<ServerState>,
}

impl MockRedis {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self { port, state }
    }

    fn config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new("127.0.0.1", self.port);
        config.command_timeout_ms = 500;
        // Probes would show up as extra connections.
        config.reconnect.probe_interval_ms = 60_000;
        config
    }
}

async fn serve(mut stream: TcpStream, state: Arc<ServerState>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        while let Ok(Some(frame)) = decode(&mut buf) {
            let Reply::Array(items) = frame else { return };
            let args: Vec<Bytes> = items
                .into_iter()
                .filter_map(|item| match item {
                    Reply::BulkString(data) => Some(data),
                    _ => None,
                })
                .collect();

            if state.drop_next.swap(false, Ordering::SeqCst) {
                return;
            }

            let mut out = BytesMut::new();
            write_reply(&respond(&state, &args), &mut out);
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn respond(state: &ServerState, args: &[Bytes]) -> Reply {
    let name = String::from_utf8_lossy(&args[0]).to_uppercase();
    match (name.as_str(), args.len()) {
        ("PING", 1) => Reply::SimpleString("PONG".into()),
        ("ECHO", 2) => Reply::BulkString(args[1].clone()),
        ("SET", 3) => {
            let mut data = state.data.lock().unwrap();
            data.insert(args[1].clone(), args[2].clone());
            Reply::SimpleString("OK".into())
        }
        ("GET", 2) => {
            let data = state.data.lock().unwrap();
            data.get(&args[1]).cloned().map_or(Reply::Null, Reply::BulkString)
        }
        _ => Reply::Error(format!("ERR unknown command '{}'", name.to_lowercase())),
    }
}

fn write_reply(reply: &Reply, out: &mut BytesMut) {
    match reply {
        Reply::SimpleString(s) => out.put_slice(format!("+{}\r\n", s).as_bytes()),
        Reply::Error(e) => out.put_slice(format!("-{}\r\n", e).as_bytes()),
        Reply::Integer(n) => out.put_slice(format!(":{}\r\n", n).as_bytes()),
        Reply::BulkString(data) => {
            out.put_slice(format!("${}\r\n", data.len()).as_bytes());
            out.put_slice(data);
            out.put_slice(b"\r\n");
        }
        Reply::Null => out.put_slice(b"$-1\r\n"),
        Reply::Array(items) => {
            out.put_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                write_reply(item, out);
            }
        }
    }
}

/// SSH server that turns down every password
struct RejectingSshServer;

impl server::Handler for RejectingSshServer {
    type Error = russh::Error;

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::reject())
    }
}

async fn start_rejecting_ssh_server() -> u16 {
    let mut config = server::Config::default();
    config.auth_rejection_time = Duration::from_millis(10);
    config.auth_rejection_time_initial = Some(Duration::ZERO);
    config
        .keys
        .push(PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());
    let config = Arc::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, stream, RejectingSshServer).await {
                    let _ = session.await;
                }
            });
        }
    });
    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn connect_emits_connected_once_and_pipelines() {
    let server = MockRedis::start().await;
    let client = RedisClient::new();
    let mut events = client.subscribe();

    client.connect(server.config()).await.unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.status, ConnectionStatus::Connected);
    assert_eq!(event.endpoint, format!("127.0.0.1:{}", server.port));

    let replies = client
        .execute_pipeline(&[
            Command::new("SET").arg("lang").arg("rust"),
            Command::new("GET").arg("lang"),
            Command::new("GET").arg("missing"),
        ])
        .await
        .unwrap();
    assert_eq!(
        replies,
        vec![
            Reply::SimpleString("OK".into()),
            Reply::BulkString(Bytes::from("rust")),
            Reply::Null,
        ]
    );

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(events.try_recv().is_err(), "only one Connected event expected");
    client.disconnect().await;
}

#[tokio::test]
async fn peer_close_mid_command_is_retried() {
    let server = MockRedis::start().await;
    let client = RedisClient::new();
    client.connect(server.config()).await.unwrap();
    assert_eq!(server.state.connections.load(Ordering::SeqCst), 1);

    server.state.drop_next.store(true, Ordering::SeqCst);
    let reply = client
        .execute(&Command::new("ECHO").arg("hello"))
        .await
        .unwrap();
    assert_eq!(reply, Reply::BulkString(Bytes::from("hello")));

    // The retry ran on a fresh connection.
    assert_eq!(server.state.connections.load(Ordering::SeqCst), 2);
    assert!(client.is_connected());
    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_then_reconnect() {
    let server = MockRedis::start().await;
    let client = RedisClient::new();
    let mut events = client.subscribe();

    client.connect(server.config()).await.unwrap();
    client.disconnect().await;
    assert_eq!(events.recv().await.unwrap().status, ConnectionStatus::Connected);
    assert_eq!(events.recv().await.unwrap().status, ConnectionStatus::Disconnected);
    assert!(client.pool_stats().await.is_none());

    client.connect(server.config()).await.unwrap();
    assert!(client.execute(&Command::new("PING")).await.unwrap().into_result().is_ok());
    client.disconnect().await;
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let client = RedisClient::new();
    let err = client
        .connect(ConnectionConfig::new("", 6379))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Config(_)));
}

#[tokio::test]
async fn refused_redis_port_is_connect_error() {
    let port = free_port().await;
    let client = RedisClient::new();
    let err = client
        .connect(ConnectionConfig::new("127.0.0.1", port))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Transport(TransportError::Connect(_))));
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn unreachable_jump_host_leaves_no_pool_or_forward() {
    let jump_port = free_port().await;
    let forward_port = free_port().await;

    let mut ssh = SshTunnelConfig::new(
        "127.0.0.1",
        "deploy",
        SshAuth::Password {
            password: Secret::new("hunter2"),
        },
    );
    ssh.port = jump_port;
    ssh.local_port = forward_port;
    ssh.host_key_policy = HostKeyPolicy::AcceptAny;

    let mut config = ConnectionConfig::new("10.0.0.5", 6379);
    config.ssh = Some(ssh);
    config.connect_timeout_ms = 1_000;

    let client = RedisClient::new();
    let err = client.connect(config).await.unwrap_err();
    assert!(
        matches!(err, ConnectError::Transport(TransportError::Connect(_))),
        "got {:?}",
        err
    );
    assert!(client.pool_stats().await.is_none());
    assert!(TcpListener::bind(("127.0.0.1", forward_port)).await.is_ok());
}

#[tokio::test]
async fn ssh_auth_failure_leaves_no_pool_or_forward() {
    let jump_port = start_rejecting_ssh_server().await;
    let forward_port = free_port().await;

    let mut ssh = SshTunnelConfig::new(
        "127.0.0.1",
        "deploy",
        SshAuth::Password {
            password: Secret::new("wrong"),
        },
    );
    ssh.port = jump_port;
    ssh.local_port = forward_port;
    ssh.host_key_policy = HostKeyPolicy::AcceptAny;

    let mut config = ConnectionConfig::new("10.0.0.5", 6379);
    config.ssh = Some(ssh);
    config.connect_timeout_ms = 5_000;

    let client = RedisClient::new();
    let err = client.connect(config).await.unwrap_err();
    assert!(
        matches!(err, ConnectError::Transport(TransportError::Auth(_))),
        "got {:?}",
        err
    );
    assert!(client.pool_stats().await.is_none());
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(TcpListener::bind(("127.0.0.1", forward_port)).await.is_ok());
}
