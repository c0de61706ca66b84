// In-memory Redis stand-in for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use redis_tunnel_common::TransportError;

use crate::reply::Reply;
use crate::resp::decode;
use crate::transport::{Connector, Transport, TransportKind};

struct MockState {
    data: Mutex<HashMap<Bytes, Bytes>>,
    password: Option<String>,
    commands: Mutex<Vec<Vec<String>>>,
    kill: watch::Sender<u64>,
}

/// Shared key space served to any number of streams
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<MockState>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_password(password: &str) -> Self {
        Self::build(Some(password.to_string()))
    }

    fn build(password: Option<String>) -> Self {
        Self {
            inner: Arc::new(MockState {
                data: Mutex::new(HashMap::new()),
                password,
                commands: Mutex::new(Vec::new()),
                kill: watch::channel(0).0,
            }),
        }
    }

    /// Every command received so far, across connections
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.inner.commands.lock().unwrap().clone()
    }

    /// Drop every open stream without replying
    pub fn kill_all(&self) {
        self.inner.kill.send_modify(|generation| *generation += 1);
    }

    pub fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let state = self.inner.clone();
        let mut kill = state.kill.subscribe();
        tokio::spawn(async move {
            let mut stream = stream;
            let mut buf = BytesMut::with_capacity(4096);
            let mut authed = state.password.is_none();
            loop {
                while let Ok(Some(frame)) = decode(&mut buf) {
                    let Some(args) = frame_args(frame) else { return };
                    let Some(response) = handle(&state, &mut authed, args).await else {
                        return;
                    };
                    let mut out = BytesMut::new();
                    match response {
                        Response::Reply(reply) => encode_reply(&reply, &mut out),
                        Response::Raw(bytes) => out.put_slice(bytes),
                    }
                    if stream.write_all(&out).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    biased;
                    _ = kill.changed() => return,
                    read = stream.read_buf(&mut buf) => match read {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    },
                }
            }
        });
    }
}

fn frame_args(frame: Reply) -> Option<Vec<Bytes>> {
    match frame {
        Reply::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Reply::BulkString(data) => Some(data),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

enum Response {
    Reply(Reply),
    /// Written as is, for replies no RESP encoder would produce
    Raw(&'static [u8]),
}

/// `None` closes the stream without a reply
async fn handle(state: &MockState, authed: &mut bool, args: Vec<Bytes>) -> Option<Response> {
    let words: Vec<String> = args
        .iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();
    state.commands.lock().unwrap().push(words.clone());
    let name = words.first()?.to_uppercase();

    if !*authed && name != "AUTH" {
        return Some(Response::Reply(Reply::Error(
            "NOAUTH Authentication required.".into(),
        )));
    }

    let reply = match (name.as_str(), args.len()) {
        ("PING", 1) => Reply::SimpleString("PONG".into()),
        ("ECHO", 2) => Reply::BulkString(args[1].clone()),
        ("AUTH", 2 | 3) => {
            if state.password.as_deref() == words.last().map(String::as_str) {
                *authed = true;
                Reply::SimpleString("OK".into())
            } else {
                Reply::Error(
                    "WRONGPASS invalid username-password pair or user is disabled.".into(),
                )
            }
        }
        ("SELECT", 2) => Reply::SimpleString("OK".into()),
        ("SET", 3) => {
            state
                .data
                .lock()
                .unwrap()
                .insert(args[1].clone(), args[2].clone());
            Reply::SimpleString("OK".into())
        }
        ("GET", 2) => {
            let value = state.data.lock().unwrap().get(&args[1]).cloned();
            value.map_or(Reply::Null, Reply::BulkString)
        }
        ("SLEEP", 2) => {
            let millis = words[1].parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Reply::SimpleString("OK".into())
        }
        ("KILL", 1) => return None,
        ("GARBAGE", 1) => return Some(Response::Raw(b"?not resp\r\n")),
        _ => Reply::Error(format!("ERR unknown command '{}'", words[0])),
    };
    Some(Response::Reply(reply))
}

pub fn encode_reply(reply: &Reply, out: &mut BytesMut) {
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
                encode_reply(item, out);
            }
        }
    }
}

/// Connector handing out in-memory streams to a `MockServer`
pub struct MockConnector {
    server: MockServer,
    refusing: AtomicBool,
    opened: AtomicUsize,
}

impl MockConnector {
    pub fn new(server: MockServer) -> Self {
        Self {
            server,
            refusing: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
        }
    }

    /// Make `open()` fail as if the port were closed
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Transport, TransportError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("mock:6379: connection refused".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.server.serve(server);
        Ok(Transport::new(client, TransportKind::Custom, "mock:6379"))
    }

    fn endpoint(&self) -> String {
        "mock:6379".to_string()
    }
}
