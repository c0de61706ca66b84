// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Tunnel Module
// SSH session with one local port forwarded to the Redis endpoint (russh)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use redis_tunnel_common::{
    format_host_port, is_loopback_address, HostKeyPolicy, Secret, SshAuth, SshTunnelConfig,
    TransportError,
};

use crate::known_hosts::{check_host_key, HostKey, KnownHosts};

/// Consecutive channel failures after which the session is considered dead
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// How long `close()` waits for the forwarder to disconnect gracefully
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// SSH client handler verifying the server key against known_hosts
struct TunnelHandler {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
    policy: HostKeyPolicy,
    /// Why the key was rejected, so the caller gets `HostKey` instead of a bare russh error
    rejection: Arc<Mutex<Option<TransportError>>>,
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let key = HostKey::from_public_key(server_public_key);
        match check_host_key(&self.known_hosts_path, &self.host, self.port, &key, self.policy) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Rejecting SSH server {}:{}: {}", self.host, self.port, e);
                *self.rejection.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                Ok(false)
            }
        }
    }
}

/// An authenticated SSH session forwarding a local port to one target.
///
/// Transports opened through the tunnel hold an `Arc` to it, so the session
/// stays up until the last of them is gone or `close()` is called.
pub struct SshTunnel {
    endpoint: String,
    target: String,
    local_addr: SocketAddr,
    session: Arc<Handle<TunnelHandler>>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("endpoint", &self.endpoint)
            .field("target", &self.target)
            .field("local_addr", &self.local_addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl SshTunnel {
    /// Connect, authenticate and start forwarding `local_addr` to `target_host:target_port`
    pub async fn open(
        ssh: &SshTunnelConfig,
        target_host: &str,
        target_port: u16,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let endpoint = ssh.endpoint();
        let target = format_host_port(target_host, target_port);

        // --- SSH client configuration ---
        let mut cfg = Config::default();
        cfg.window_size = ssh.window_size;
        cfg.maximum_packet_size = ssh.max_packet_size;
        cfg.nodelay = true;
        if ssh.keepalive_interval_secs > 0 {
            cfg.keepalive_interval = Some(Duration::from_secs(ssh.keepalive_interval_secs));
            cfg.keepalive_max = 3;
        }

        let known_hosts_path = match &ssh.known_hosts_path {
            Some(path) => path.clone(),
            None => KnownHosts::default_path().map_err(|e| TransportError::HostKey(e.to_string()))?,
        };
        let rejection = Arc::new(Mutex::new(None));
        let handler = TunnelHandler {
            host: ssh.host.clone(),
            port: ssh.port,
            known_hosts_path,
            policy: ssh.host_key_policy,
            rejection: rejection.clone(),
        };

        info!("Connecting to SSH server: {}", endpoint);
        let mut session = match tokio::time::timeout(
            connect_timeout,
            client::connect(Arc::new(cfg), (ssh.host.as_str(), ssh.port), handler),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                let rejected = rejection.lock().unwrap_or_else(PoisonError::into_inner).take();
                return Err(rejected.unwrap_or_else(|| {
                    TransportError::Connect(format!("SSH connection to {} failed: {}", endpoint, e))
                }));
            }
            Err(_) => {
                warn!("SSH connection to {} timed out after {:?}", endpoint, connect_timeout);
                return Err(TransportError::Timeout(connect_timeout));
            }
        };

        authenticate(&mut session, ssh).await?;
        info!("SSH authentication successful for {}@{}", ssh.user, endpoint);

        let session = Arc::new(session);

        if !is_loopback_address(&ssh.bind_address) {
            warn!(
                "Forwarded port is bound to non-loopback address {}; Redis becomes reachable from the network",
                ssh.bind_address
            );
        }
        let listener = TcpListener::bind((ssh.bind_address.as_str(), ssh.local_port))
            .await
            .map_err(|e| {
                TransportError::Forward(format!(
                    "failed to bind {}: {}",
                    format_host_port(&ssh.bind_address, ssh.local_port),
                    e
                ))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Forward(e.to_string()))?;

        // Make sure the server is willing to forward before handing out the port.
        let probe = session
            .channel_open_direct_tcpip(
                target_host,
                target_port.into(),
                &local_addr.ip().to_string(),
                local_addr.port().into(),
            )
            .await
            .map_err(|e| {
                TransportError::Forward(format!("{} refused forwarding to {}: {}", endpoint, target, e))
            })?;
        if let Err(e) = probe.close().await {
            debug!("Failed to close forward probe channel: {}", e);
        }

        info!("Forwarding {} -> {} via {}", local_addr, target, endpoint);

        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_loop(
            listener,
            session.clone(),
            target_host.to_string(),
            target_port,
            alive.clone(),
            cancel.clone(),
        ));

        Ok(Arc::new(SshTunnel {
            endpoint,
            target,
            local_addr,
            session,
            alive,
            cancel,
            forwarder: Mutex::new(Some(forwarder)),
        }))
    }

    /// Local address that forwards to the target
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Jump host in `host:port` form
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.session.is_closed()
    }

    /// Open a TCP connection to the forwarded local port
    pub async fn connect_local(&self) -> Result<TcpStream, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Forward(format!(
                "tunnel via {} is down",
                self.endpoint
            )));
        }
        let stream = TcpStream::connect(self.local_addr)
            .await
            .map_err(|e| TransportError::Forward(format!("forwarded port {}: {}", self.local_addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Forward(e.to_string()))?;
        Ok(stream)
    }

    /// Stop forwarding and disconnect the SSH session
    pub async fn close(&self) {
        self.cancel.cancel();
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = forwarder {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        info!("Tunnel via {} closed", self.endpoint);
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        // The forwarder owns the listener and disconnects the session on exit.
        self.cancel.cancel();
    }
}

/// Authenticate with the SSH server using the configured method
async fn authenticate(
    session: &mut Handle<TunnelHandler>,
    ssh: &SshTunnelConfig,
) -> Result<(), TransportError> {
    let auth_result = match &ssh.auth {
        SshAuth::Password { password } => {
            info!("Authenticating with password");
            session
                .authenticate_password(ssh.user.as_str(), password.expose())
                .await
        }
        SshAuth::Key {
            key_path,
            passphrase,
        } => {
            info!("Authenticating with key: {}", key_path.display());
            let key = load_secret_key(key_path, passphrase.as_ref().map(Secret::expose)).map_err(
                |e| {
                    TransportError::Auth(format!(
                        "failed to load SSH key from {}: {}",
                        key_path.display(),
                        e
                    ))
                },
            )?;

            // Prepare key with hash algorithm (for RSA); non-RSA keys ignore it
            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .map_err(|e| TransportError::Auth(e.to_string()))?
                .flatten();
            session
                .authenticate_publickey(
                    ssh.user.as_str(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
        }
    }
    .map_err(|e| TransportError::Auth(e.to_string()))?;

    match auth_result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();
            let reason = auth_failure_reason(&ssh.user, &methods, partial_success);
            error!("{}", reason);
            Err(TransportError::Auth(reason))
        }
    }
}

fn auth_failure_reason(user: &str, methods: &[String], partial_success: bool) -> String {
    let methods_str = if methods.is_empty() {
        "no authentication methods left".to_string()
    } else {
        format!("server requires: {}", methods.join(", "))
    };
    if partial_success {
        format!(
            "authentication for {} partially succeeded; {} (multi-step auth is not supported)",
            user, methods_str
        )
    } else {
        format!("authentication for {} rejected; {}", user, methods_str)
    }
}

/// Accept local connections and pipe each through a `direct-tcpip` channel
async fn forward_loop(
    listener: TcpListener,
    session: Arc<Handle<TunnelHandler>>,
    target_host: String,
    target_port: u16,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut consecutive_failures = 0;

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept forwarded connection: {}", e);
                    continue;
                }
            },
        };
        debug!("Accepted forwarded connection from {}", peer_addr);

        match session
            .channel_open_direct_tcpip(
                target_host.as_str(),
                target_port.into(),
                &peer_addr.ip().to_string(),
                peer_addr.port().into(),
            )
            .await
        {
            Ok(channel) => {
                consecutive_failures = 0;
                tokio::spawn(async move {
                    let mut tcp_stream = stream;
                    let mut channel_stream = channel.into_stream();
                    match copy_bidirectional(&mut tcp_stream, &mut channel_stream).await {
                        Ok((to_remote, to_local)) => debug!(
                            "Forwarded connection closed: {} bytes out, {} bytes in",
                            to_remote, to_local
                        ),
                        Err(e) => debug!("Forwarded connection ended: {}", e),
                    }
                });
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    "Failed to open channel ({}/{}): {}",
                    consecutive_failures, MAX_CONSECUTIVE_FAILURES, e
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(
                        "SSH session appears dead after {} consecutive channel failures",
                        MAX_CONSECUTIVE_FAILURES
                    );
                    break;
                }
            }
        }
    }

    alive.store(false, Ordering::Release);
    if let Err(e) = session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("Failed to disconnect gracefully: {}", e);
    }
}
