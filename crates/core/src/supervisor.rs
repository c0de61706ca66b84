// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Supervisor Module
// Watches reachability, reconnects with backoff, reports status transitions

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use redis_tunnel_common::{ConnectionStatus, ReconnectOptions, Result, StatusEvent, Uuid};

use crate::monitor::ReachabilityProbe;
use crate::pool::ConnectionPool;

/// Pending link-failure reports beyond this are dropped; one is enough to act on
const SIGNAL_CAPACITY: usize = 16;

/// Publishes status transitions for one session
#[derive(Clone)]
pub struct StatusEmitter {
    events: broadcast::Sender<StatusEvent>,
    current: Arc<watch::Sender<ConnectionStatus>>,
    session_id: Uuid,
    endpoint: String,
}

impl StatusEmitter {
    pub fn new(
        events: broadcast::Sender<StatusEvent>,
        current: Arc<watch::Sender<ConnectionStatus>>,
        session_id: Uuid,
        endpoint: String,
    ) -> Self {
        Self {
            events,
            current,
            session_id,
            endpoint,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn emit(&self, status: ConnectionStatus) {
        self.publish(StatusEvent::new(self.session_id, &self.endpoint, status));
    }

    pub fn emit_attempt(&self, status: ConnectionStatus, attempt: u32) {
        self.publish(StatusEvent::new(self.session_id, &self.endpoint, status).with_attempt(attempt));
    }

    fn publish(&self, event: StatusEvent) {
        debug!("Status of {} -> {:?}", self.endpoint, event.status);
        self.current.send_replace(event.status.clone());
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Apply `± jitter` (fraction of the delay) to a backoff delay
pub fn jittered(delay: Duration, jitter: f64) -> Duration {
    if delay.is_zero() || jitter <= 0.0 {
        return delay;
    }
    let jitter = jitter.min(1.0);
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64(factor.max(0.0))
}

enum Outcome {
    Reconnected,
    Cancelled,
    Exhausted(String),
}

/// Per-session reconnection supervisor
pub struct Supervisor {
    pool: ConnectionPool,
    probe: Arc<dyn ReachabilityProbe>,
    emitter: StatusEmitter,
    options: ReconnectOptions,
    acquire_timeout: Duration,
    command_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        pool: ConnectionPool,
        probe: Arc<dyn ReachabilityProbe>,
        emitter: StatusEmitter,
        options: ReconnectOptions,
        acquire_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            probe,
            emitter,
            options,
            acquire_timeout,
            command_timeout,
        }
    }

    /// Start supervising; the session is assumed to be connected
    pub fn spawn(self) -> SupervisorHandle {
        let cancel = CancellationToken::new();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        let task = tokio::spawn(self.run(cancel.clone(), signal_rx));
        SupervisorHandle {
            cancel,
            signals: signal_tx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(self, cancel: CancellationToken, mut signals: mpsc::Receiver<String>) {
        let mut ticker = tokio::time::interval(self.options.probe_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the session was just checked.
        ticker.tick().await;

        let mut link_up = true;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(reason) = signals.recv() => {
                    if link_up {
                        warn!("Link failure reported: {}", reason);
                        link_up = false;
                        self.emitter.emit(ConnectionStatus::Disconnected);
                    }
                }

                _ = ticker.tick() => {
                    let reachable = tokio::select! {
                        _ = cancel.cancelled() => break,
                        reachable = self.probe.probe() => reachable,
                    };

                    if link_up {
                        if !reachable {
                            warn!("First hop is unreachable");
                            link_up = false;
                            self.emitter.emit(ConnectionStatus::Disconnected);
                        }
                    } else if reachable {
                        match self.reconnect(&cancel).await {
                            Outcome::Reconnected => {
                                // Reports queued during the outage describe the old pool.
                                let mut stale = 0;
                                while signals.try_recv().is_ok() {
                                    stale += 1;
                                }
                                if stale > 0 {
                                    debug!("Dropped {} link failure report(s) from before recovery", stale);
                                }
                                link_up = true;
                            }
                            Outcome::Cancelled => break,
                            Outcome::Exhausted(reason) => {
                                error!("Giving up on reconnection: {}", reason);
                                self.emitter.emit(ConnectionStatus::Failed(reason));
                                break;
                            }
                        }
                    } else {
                        debug!("First hop still unreachable");
                    }
                }
            }
        }
        debug!("Supervisor for session {} stopped", self.emitter.session_id());
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Outcome {
        let max_attempts = self.options.max_attempts;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            let delay = jittered(self.options.base_delay_for(attempt), self.options.jitter);
            if !delay.is_zero() {
                debug!("Waiting {:?} before reconnection attempt {}", delay, attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Outcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            info!("Reconnecting (attempt {}/{})", attempt, max_attempts);
            self.emitter
                .emit_attempt(ConnectionStatus::Reconnecting, attempt);

            // Stale connections share the dead peer; start from an empty pool.
            self.pool.drain_and_close().await;

            let checked = tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,
                checked = self.health_check() => checked,
            };
            match checked {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                    self.emitter.emit(ConnectionStatus::Connected);
                    return Outcome::Reconnected;
                }
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            }
        }

        Outcome::Exhausted(format!(
            "gave up after {} attempts: {}",
            max_attempts, last_error
        ))
    }

    async fn health_check(&self) -> Result<()> {
        let lease = self.pool.acquire(self.acquire_timeout).await?;
        let result = lease.ping(self.command_timeout).await;
        self.pool.release(lease, result.is_ok());
        result
    }
}

/// Control side of a running supervisor
pub struct SupervisorHandle {
    cancel: CancellationToken,
    signals: mpsc::Sender<String>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorHandle {
    /// Tell the supervisor the link failed underneath a request
    pub fn report_link_failure(&self, reason: impl Into<String>) {
        if self.signals.try_send(reason.into()).is_err() {
            debug!("Supervisor busy or stopped, link failure report dropped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Cancel and wait for the supervisor task to finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionFactory, Handshake};
    use crate::testing::{MockConnector, MockServer};
    use async_trait::async_trait;
    use redis_tunnel_common::PoolOptions;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SwitchProbe(Arc<AtomicBool>);

    #[async_trait]
    impl ReachabilityProbe for SwitchProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        pool: ConnectionPool,
        connector: Arc<MockConnector>,
        reachable: Arc<AtomicBool>,
        events: broadcast::Receiver<StatusEvent>,
        handle: SupervisorHandle,
    }

    fn options(max_attempts: u32) -> ReconnectOptions {
        ReconnectOptions {
            max_attempts,
            base_delay_ms: 5,
            multiplier: 2.0,
            max_delay_ms: 20,
            jitter: 0.0,
            probe_interval_ms: 10,
            probe_timeout_ms: 10,
        }
    }

    async fn start(reconnect: ReconnectOptions) -> Harness {
        let connector = Arc::new(MockConnector::new(MockServer::new()));
        let factory = ConnectionFactory::new(
            connector.clone(),
            Handshake {
                username: None,
                password: None,
                database: 0,
                timeout: Duration::from_secs(1),
            },
        );
        let pool = ConnectionPool::new(
            factory,
            PoolOptions {
                max_size: 2,
                sweep_interval_secs: 0,
                ..PoolOptions::default()
            },
        );
        // Warm one idle connection so draining is observable.
        drop(pool.acquire(Duration::from_secs(1)).await.unwrap());

        let (events_tx, events) = broadcast::channel(100);
        let status = Arc::new(watch::channel(ConnectionStatus::Connected).0);
        let emitter = StatusEmitter::new(events_tx, status, Uuid::new_v4(), "mock:6379".into());
        let reachable = Arc::new(AtomicBool::new(true));
        let handle = Supervisor::new(
            pool.clone(),
            Arc::new(SwitchProbe(reachable.clone())),
            emitter,
            reconnect,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .spawn();

        Harness {
            pool,
            connector,
            reachable,
            events,
            handle,
        }
    }

    async fn next_status(events: &mut broadcast::Receiver<StatusEvent>) -> (ConnectionStatus, Option<u32>) {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no status event")
            .unwrap();
        (event.status, event.attempt)
    }

    #[tokio::test]
    async fn test_unreachable_then_reconnected() {
        let mut h = start(options(3)).await;
        assert_eq!(h.connector.opened(), 1);

        h.reachable.store(false, Ordering::SeqCst);
        assert_eq!(next_status(&mut h.events).await.0, ConnectionStatus::Disconnected);

        h.reachable.store(true, Ordering::SeqCst);
        assert_eq!(
            next_status(&mut h.events).await,
            (ConnectionStatus::Reconnecting, Some(1))
        );
        assert_eq!(next_status(&mut h.events).await.0, ConnectionStatus::Connected);

        // The warm idle connection was drained; the health check opened a fresh one.
        assert_eq!(h.connector.opened(), 2);
        assert_eq!(h.pool.stats().idle, 1);
        assert!(h.handle.is_running());
        h.handle.stop().await;
    }

    #[tokio::test]
    async fn test_reported_failure_triggers_reconnect() {
        let mut h = start(options(3)).await;

        h.handle.report_link_failure("connection closed by peer");
        assert_eq!(next_status(&mut h.events).await.0, ConnectionStatus::Disconnected);
        assert_eq!(
            next_status(&mut h.events).await,
            (ConnectionStatus::Reconnecting, Some(1))
        );
        assert_eq!(next_status(&mut h.events).await.0, ConnectionStatus::Connected);
        h.handle.stop().await;
    }

    #[tokio::test]
    async fn test_reports_during_outage_do_not_outlive_recovery() {
        let mut h = start(ReconnectOptions {
            base_delay_ms: 100,
            max_delay_ms: 100,
            ..options(5)
        })
        .await;
        h.connector.set_refusing(true);

        h.handle.report_link_failure("outage");
        assert_eq!(next_status(&mut h.events).await.0, ConnectionStatus::Disconnected);
        assert_eq!(
            next_status(&mut h.events).await,
            (ConnectionStatus::Reconnecting, Some(1))
        );

        // Callers keep failing while the supervisor backs off before attempt 2.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..3 {
            h.handle.report_link_failure("connection refused");
        }
        h.connector.set_refusing(false);

        assert_eq!(
            next_status(&mut h.events).await,
            (ConnectionStatus::Reconnecting, Some(2))
        );
        assert_eq!(next_status(&mut h.events).await.0, ConnectionStatus::Connected);

        let opened = h.connector.opened();
        let extra = tokio::time::timeout(Duration::from_millis(200), h.events.recv()).await;
        assert!(extra.is_err(), "unexpected event after recovery: {:?}", extra);
        assert_eq!(h.connector.opened(), opened);
        assert_eq!(h.pool.stats().idle, 1);
        h.handle.stop().await;
    }

    #[tokio::test]
    async fn test_retry_budget_ends_in_failed() {
        let mut h = start(options(3)).await;
        h.connector.set_refusing(true);

        h.handle.report_link_failure("connection reset");
        assert_eq!(next_status(&mut h.events).await.0, ConnectionStatus::Disconnected);
        for attempt in 1..=3 {
            assert_eq!(
                next_status(&mut h.events).await,
                (ConnectionStatus::Reconnecting, Some(attempt))
            );
        }
        match next_status(&mut h.events).await.0 {
            ConnectionStatus::Failed(reason) => {
                assert!(reason.starts_with("gave up after 3 attempts"))
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.handle.is_running());
    }

    #[tokio::test]
    async fn test_stop_interrupts_backoff() {
        let h = start(ReconnectOptions {
            base_delay_ms: 5_000,
            max_delay_ms: 5_000,
            ..options(3)
        })
        .await;
        h.connector.set_refusing(true);
        h.handle.report_link_failure("connection reset");
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(1), h.handle.stop())
            .await
            .expect("supervisor did not stop");
        assert!(!h.handle.is_running());
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let delay = jittered(base, 0.2);
            assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
        }
        assert_eq!(jittered(base, 0.0), base);
        assert_eq!(jittered(Duration::ZERO, 0.5), Duration::ZERO);
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let opts = options(10);
        assert_eq!(opts.base_delay_for(1), Duration::ZERO);
        assert_eq!(opts.base_delay_for(2), Duration::from_millis(5));
        assert_eq!(opts.base_delay_for(3), Duration::from_millis(10));
        assert_eq!(opts.base_delay_for(6), Duration::from_millis(20));
    }
}
