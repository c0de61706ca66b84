// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Pool Module
// Bounded set of connections with exclusive leases

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use redis_tunnel_common::{Error, PoolOptions, Result};

use crate::connection::{Connection, ConnectionFactory, ConnectionState};

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub total: usize,
    pub max_size: usize,
}

#[derive(Default)]
struct PoolState {
    /// LIFO: the most recently returned connection is reused first
    idle: Vec<Connection>,
    leased: usize,
    /// Idle + leased + being created
    total: usize,
}

struct PoolInner {
    factory: ConnectionFactory,
    options: PoolOptions,
    /// One permit per lease; bounds concurrent holders to `max_size`
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    /// Bumped by `drain_and_close`; leases from older generations are not reused
    generation: AtomicU64,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Put a lease's connection back, or evict it
    fn give_back(&self, conn: Connection, generation: u64, healthy: bool) {
        let reusable = healthy
            && conn.is_alive()
            && !self.closed.load(Ordering::Acquire)
            && generation == self.current_generation();

        let evicted = {
            let mut state = self.lock_state();
            state.leased = state.leased.saturating_sub(1);
            if reusable {
                conn.set_state(ConnectionState::Idle);
                conn.touch();
                state.idle.push(conn);
                None
            } else {
                state.total = state.total.saturating_sub(1);
                Some(conn)
            }
        };

        if let Some(conn) = evicted {
            if conn.state() == ConnectionState::Broken {
                warn!("Evicting broken connection {}", conn.id());
            } else {
                debug!("Discarding connection {} on release", conn.id());
            }
            close_in_background(conn);
        }
    }

    /// Drop expired and dead idle connections, keeping at least `min_idle`
    fn sweep(&self) -> usize {
        let idle_timeout = self.options.idle_timeout();
        let expired = {
            let mut state = self.lock_state();
            let mut expired = Vec::new();

            let mut kept = Vec::with_capacity(state.idle.len());
            for conn in state.idle.drain(..) {
                if conn.is_alive() {
                    kept.push(conn);
                } else {
                    expired.push(conn);
                }
            }
            // Oldest entries sit at the front.
            while kept.len() > self.options.min_idle
                && kept
                    .first()
                    .is_some_and(|conn| conn.idle_for() >= idle_timeout)
            {
                let conn = kept.remove(0);
                debug!("Connection {} idle for {:?}, closing", conn.id(), conn.idle_for());
                expired.push(conn);
            }
            state.idle = kept;
            state.total = state.total.saturating_sub(expired.len());
            expired
        };

        let count = expired.len();
        if count > 0 {
            debug!("Swept {} idle connections", count);
        }
        for conn in expired {
            close_in_background(conn);
        }
        count
    }
}

fn close_in_background(conn: Connection) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { conn.close().await });
        }
        // No runtime left; dropping the transport closes the socket.
        Err(_) => drop(conn),
    }
}

/// Undoes a `total` reservation if connection creation does not finish
struct Reservation<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock_state();
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// Exclusive use of one pooled connection.
///
/// Dropping the lease returns the connection; it is reused only if the last
/// exchange completed cleanly.
pub struct LeasedConnection {
    conn: Option<Connection>,
    generation: u64,
    pool: Arc<PoolInner>,
    // Released after the connection is back in the idle list.
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for LeasedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedConnection")
            .field("conn", &self.conn)
            .field("generation", &self.generation)
            .finish()
    }
}

impl LeasedConnection {
    fn finish(&mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.generation, healthy);
        }
    }
}

impl Deref for LeasedConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `finish` takes the connection, and it consumes the lease.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("lease used after release"),
        }
    }
}

impl Drop for LeasedConnection {
    fn drop(&mut self) {
        let healthy = self.conn.as_ref().is_some_and(Connection::is_alive);
        self.finish(healthy);
    }
}

/// Bounded connection pool.
///
/// `idle + leased <= max_size` holds at all times; a connection is leased to
/// at most one caller at once.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create the pool; starts the idle sweeper when a runtime is available
    pub fn new(factory: ConnectionFactory, options: PoolOptions) -> Self {
        let max_size = options.max_size.max(1);
        let inner = Arc::new(PoolInner {
            factory,
            permits: Arc::new(Semaphore::new(max_size)),
            options: PoolOptions { max_size, ..options },
            state: Mutex::new(PoolState::default()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });

        if let (Some(interval), Ok(handle)) = (
            inner.options.sweep_interval(),
            tokio::runtime::Handle::try_current(),
        ) {
            let task = handle.spawn(sweep_loop(Arc::downgrade(&inner), interval));
            *inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        }

        Self { inner }
    }

    /// Hand an already established connection to the pool as idle
    pub fn seed(&self, conn: Connection) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let mut state = self.inner.lock_state();
        if state.total >= self.inner.options.max_size {
            return Err(Error::PoolExhausted);
        }
        state.total += 1;
        conn.set_state(ConnectionState::Idle);
        conn.touch();
        state.idle.push(conn);
        Ok(())
    }

    /// Lease a connection, waiting up to `timeout` for a free slot.
    ///
    /// Reuses the most recently returned idle connection, otherwise creates
    /// one while the pool is below `max_size`.
    pub async fn acquire(&self, timeout: Duration) -> Result<LeasedConnection> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let permit =
            match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::PoolClosed),
                Err(_) => {
                    debug!("No connection became available within {:?}", timeout);
                    return Err(Error::PoolExhausted);
                }
            };
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let generation = self.inner.current_generation();
        let (reused, dead) = {
            let mut state = self.inner.lock_state();
            let mut dead = Vec::new();
            let mut reused = None;
            while let Some(conn) = state.idle.pop() {
                if conn.is_alive() {
                    reused = Some(conn);
                    break;
                }
                state.total = state.total.saturating_sub(1);
                dead.push(conn);
            }
            match &reused {
                Some(_) => state.leased += 1,
                None if state.total < self.inner.options.max_size => state.total += 1,
                // Unreachable while every holder owns a permit.
                None => return Err(Error::PoolExhausted),
            }
            (reused, dead)
        };
        for conn in dead {
            warn!("Evicting dead idle connection {}", conn.id());
            close_in_background(conn);
        }

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let mut reservation = Reservation {
                    inner: &self.inner,
                    armed: true,
                };
                let conn = self.inner.factory.create().await?;
                reservation.armed = false;
                self.inner.lock_state().leased += 1;
                conn
            }
        };

        conn.set_state(ConnectionState::Leased);
        Ok(LeasedConnection {
            conn: Some(conn),
            generation,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Return a lease; the connection is reused only when `healthy`
    pub fn release(&self, mut lease: LeasedConnection, healthy: bool) {
        lease.finish(healthy);
    }

    /// Close every idle connection and mark leased ones for closing on release
    pub async fn drain_and_close(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let drained = self.take_idle();
        if !drained.is_empty() {
            info!("Draining {} idle connections", drained.len());
        }
        for conn in drained {
            conn.close().await;
        }
    }

    /// Close idle connections only; leases in flight keep their connections
    pub async fn evict_idle(&self) {
        for conn in self.take_idle() {
            conn.close().await;
        }
    }

    fn take_idle(&self) -> Vec<Connection> {
        let mut state = self.inner.lock_state();
        let drained: Vec<Connection> = state.idle.drain(..).collect();
        state.total = state.total.saturating_sub(drained.len());
        drained
    }

    /// Refuse further acquires, wake waiters with `PoolClosed`, close idle connections
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = sweeper {
            task.abort();
        }
        self.drain_and_close().await;
        debug!("Connection pool shut down");
    }

    /// Run one idle sweep now; returns the number of evicted connections
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            idle: state.idle.len(),
            leased: state.leased,
            total: state.total,
            max_size: self.inner.options.max_size,
        }
    }
}

async fn sweep_loop(pool: Weak<PoolInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else { break };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        inner.sweep();
    }
}
