//! Bounded connection pool with per-route partitions
//!
//! This module provides the pool every request borrows its connection from:
//! - A global cap and a per-route cap on open connections
//! - Exclusive checkout through a guard that frees its slot when dropped
//! - Bounded waiting for a free slot (acquire timeout)
//! - Background eviction of connections idle for too long

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::connector::{Connector, Sender};
use super::route::Route;

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Timed out after {waited:?} waiting for a connection to {route}")]
    AcquireTimeout { route: String, waited: Duration },

    #[error("Timed out after {timeout:?} connecting to {route}")]
    ConnectTimeout { route: String, timeout: Duration },

    #[error("Failed to connect to {route}: {source}")]
    Connect {
        route: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("HTTP handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of open connections across all routes
    pub max_total_connections: usize,

    /// Maximum number of open connections to one route
    pub max_per_route: usize,

    /// Maximum idle time before closing a connection
    pub idle_timeout: Duration,

    /// Interval of the background idle sweep
    pub eviction_interval: Duration,

    /// Connection timeout, TLS handshake included
    pub connect_timeout: Duration,

    /// Maximum wait for a free slot
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total_connections: 500,
            max_per_route: 300,
            idle_timeout: Duration::from_millis(30_000),
            eviction_interval: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(5_000),
            acquire_timeout: Duration::from_millis(5_000),
        }
    }
}

impl PoolConfig {
    /// Check the caps and durations before a pool is built on them
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_total_connections == 0 || self.max_per_route == 0 {
            return Err(PoolError::InvalidConfig(
                "connection caps must be greater than zero".to_string(),
            ));
        }
        if self.max_per_route > self.max_total_connections {
            return Err(PoolError::InvalidConfig(format!(
                "max_per_route ({}) exceeds max_total_connections ({})",
                self.max_per_route, self.max_total_connections
            )));
        }
        let durations = [
            ("idle_timeout", self.idle_timeout),
            ("eviction_interval", self.eviction_interval),
            ("connect_timeout", self.connect_timeout),
            ("acquire_timeout", self.acquire_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(PoolError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Statistics for the whole pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Open connections, leased and idle
    pub open: usize,

    /// Connections currently checked out
    pub leased: usize,

    /// Connections waiting in the idle set
    pub idle: usize,

    /// Total connections created
    pub total_created: u64,

    /// Total checkouts served from the idle set
    pub total_reused: u64,

    /// Connections closed because they were broken or not reusable
    pub total_discarded: u64,

    /// Idle connections closed by the sweep or to make room for another route
    pub total_evicted: u64,
}

/// Statistics for one route
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub open: usize,
    pub leased: usize,
    pub idle: usize,
}

/// A connection resting in the idle set
struct IdleConnection {
    sender: Sender,
    created_at: Instant,
    idle_since: Instant,
    use_count: u64,
}

impl IdleConnection {
    fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.sender.is_closed() || now.duration_since(self.idle_since) >= idle_timeout
    }
}

/// Per-route partition of the pool
#[derive(Default)]
struct RoutePool {
    /// Oldest at the front, most recently returned at the back
    idle: VecDeque<IdleConnection>,

    /// Open connections of this route, leased or idle
    open: usize,
}

#[derive(Default)]
struct PoolState {
    routes: HashMap<Route, RoutePool>,
    open: usize,
    total_created: u64,
    total_reused: u64,
    total_discarded: u64,
    total_evicted: u64,
}

enum Checkout {
    Idle(IdleConnection),
    Reserved,
}

impl PoolState {
    /// Try to hand out a connection or a slot for a new one without waiting
    ///
    /// Connections that have to be closed are pushed to `closed` so the caller
    /// drops them after releasing the lock.
    fn try_checkout(
        &mut self,
        route: &Route,
        config: &PoolConfig,
        closed: &mut Vec<IdleConnection>,
    ) -> Option<Checkout> {
        let now = Instant::now();

        if let Some(partition) = self.routes.get_mut(route) {
            while let Some(conn) = partition.idle.pop_back() {
                if !conn.is_expired(now, config.idle_timeout) {
                    return Some(Checkout::Idle(conn));
                }
                partition.open -= 1;
                self.open -= 1;
                self.total_discarded += 1;
                closed.push(conn);
            }
        }

        let route_open = self.routes.get(route).map_or(0, |p| p.open);
        if route_open >= config.max_per_route {
            return None;
        }

        if self.open >= config.max_total_connections {
            match self.evict_oldest_idle(route) {
                Some(conn) => closed.push(conn),
                None => {
                    self.prune(route);
                    return None;
                }
            }
        }

        let partition = self.routes.entry(route.clone()).or_default();
        partition.open += 1;
        self.open += 1;
        Some(Checkout::Reserved)
    }

    /// Close the least recently used idle connection of another route
    fn evict_oldest_idle(&mut self, except: &Route) -> Option<IdleConnection> {
        let victim = self
            .routes
            .iter()
            .filter(|(route, _)| *route != except)
            .filter_map(|(route, p)| p.idle.front().map(|c| (route, c.idle_since)))
            .min_by_key(|(_, idle_since)| *idle_since)
            .map(|(route, _)| route.clone())?;

        let partition = self.routes.get_mut(&victim)?;
        let conn = partition.idle.pop_front()?;
        partition.open -= 1;
        self.open -= 1;
        self.total_evicted += 1;
        self.prune(&victim);

        debug!(route = %victim, "Evicted idle connection to make room");
        Some(conn)
    }

    /// Give a leased slot back, keeping the connection when it is still usable
    fn check_in(&mut self, route: &Route, conn: Option<IdleConnection>) -> Option<IdleConnection> {
        match conn {
            Some(conn) => match self.routes.get_mut(route) {
                Some(partition) => {
                    partition.idle.push_back(conn);
                    None
                }
                None => Some(conn),
            },
            None => {
                self.free_slot(route, true);
                None
            }
        }
    }

    /// Free a slot; `discarded` is false for a slot whose connection never opened
    fn free_slot(&mut self, route: &Route, discarded: bool) {
        if let Some(partition) = self.routes.get_mut(route) {
            partition.open = partition.open.saturating_sub(1);
            self.open = self.open.saturating_sub(1);
            if discarded {
                self.total_discarded += 1;
            }
        }
        self.prune(route);
    }

    fn prune(&mut self, route: &Route) {
        if self.routes.get(route).is_some_and(|p| p.open == 0) {
            self.routes.remove(route);
        }
    }

    fn detach_expired(&mut self, now: Instant, idle_timeout: Duration) -> Vec<IdleConnection> {
        let mut expired = Vec::new();

        for partition in self.routes.values_mut() {
            let before = partition.idle.len();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = partition
                .idle
                .drain(..)
                .partition(|c| c.is_expired(now, idle_timeout));
            partition.idle = fresh;
            partition.open -= before - partition.idle.len();
            expired.extend(stale);
        }

        self.open -= expired.len();
        self.total_evicted += expired.len() as u64;
        self.routes.retain(|_, p| p.open > 0);
        expired
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Connector,
    state: Mutex<PoolState>,
    /// Signalled whenever a slot or an idle connection becomes available
    available: Notify,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_in(&self, route: &Route, conn: Option<IdleConnection>) {
        let rejected = self.lock_state().check_in(route, conn);
        drop(rejected);
        self.available.notify_waiters();
    }

    fn free_slot(&self, route: &Route, discarded: bool) {
        self.lock_state().free_slot(route, discarded);
        self.available.notify_waiters();
    }

    fn evict_expired(&self) -> usize {
        let expired = self
            .lock_state()
            .detach_expired(Instant::now(), self.config.idle_timeout);
        let count = expired.len();

        // Closed outside the lock
        drop(expired);

        if count > 0 {
            debug!(evicted = count, "Evicted idle connections");
            self.available.notify_waiters();
        }
        count
    }
}

/// A slot counted against the caps while its connection is being opened
struct SlotReservation {
    inner: Arc<PoolInner>,
    route: Route,
    armed: bool,
}

impl SlotReservation {
    fn fulfil(mut self, sender: Sender) -> PooledConnection {
        self.armed = false;
        self.inner.lock_state().total_created += 1;

        PooledConnection {
            inner: Arc::clone(&self.inner),
            route: self.route.clone(),
            sender: Some(sender),
            created_at: Instant::now(),
            use_count: 0,
            reused: false,
        }
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            self.inner.free_slot(&self.route, false);
        }
    }
}

/// A connection checked out of the pool
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it without a
/// release closes the connection and frees its slot.
pub struct PooledConnection {
    inner: Arc<PoolInner>,
    route: Route,
    sender: Option<Sender>,
    created_at: Instant,
    use_count: u64,
    reused: bool,
}

impl PooledConnection {
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Whether the connection came from the idle set
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Whether the peer or the transport has closed the connection
    pub fn is_closed(&self) -> bool {
        self.sender.as_ref().map_or(true, |s| s.is_closed())
    }

    /// Wait until the connection can take a request
    ///
    /// Returns false when the connection has closed in the meantime.
    async fn is_ready(&mut self) -> bool {
        match self.sender.as_mut() {
            Some(sender) => sender.ready().await.is_ok(),
            None => false,
        }
    }

    /// Get the HTTP/1.1 sender, counting a use
    pub fn sender(&mut self) -> Option<&mut Sender> {
        self.use_count += 1;
        self.sender.as_mut()
    }

    fn give_back(&mut self, reusable: bool) {
        let Some(sender) = self.sender.take() else {
            return;
        };

        if reusable && sender.is_closed() {
            debug!(route = %self.route, "Connection closed by peer, discarding");
        }

        let conn = (reusable && !sender.is_closed()).then(|| IdleConnection {
            sender,
            created_at: self.created_at,
            idle_since: Instant::now(),
            use_count: self.use_count,
        });

        self.inner.check_in(&self.route, conn);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.give_back(false);
    }
}

/// Connection pool shared by every request of a client
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a new connection pool
    ///
    /// When called inside a Tokio runtime this also starts the background idle
    /// sweep; it stops once the last handle to the pool is gone.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let connector = Connector::new(config.connect_timeout)?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
            }),
        };

        pool.start_eviction_task();

        info!(
            max_total = pool.inner.config.max_total_connections,
            max_per_route = pool.inner.config.max_per_route,
            idle_timeout_ms = pool.inner.config.idle_timeout.as_millis() as u64,
            "Connection pool created"
        );

        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a connection for the route
    ///
    /// Reuses an idle connection when one is available, otherwise opens a new
    /// one if the caps allow, otherwise waits for a release. Fails with
    /// [`PoolError::AcquireTimeout`] when nothing frees up in time.
    ///
    /// An idle connection is only handed out once it is ready to send; one
    /// the peer has closed is discarded and the checkout starts over, all
    /// within the same acquire timeout.
    pub async fn acquire(&self, route: &Route) -> Result<PooledConnection, PoolError> {
        let waited = self.inner.config.acquire_timeout;
        let deadline = tokio::time::Instant::now() + waited;
        let exhausted = || {
            warn!(route = %route, waited_ms = waited.as_millis() as u64, "Connection pool exhausted");
            PoolError::AcquireTimeout {
                route: route.to_string(),
                waited,
            }
        };

        loop {
            let checkout = tokio::time::timeout_at(deadline, self.wait_for_checkout(route))
                .await
                .map_err(|_| exhausted())?;

            match checkout {
                Ok(mut conn) => {
                    let ready = tokio::time::timeout_at(deadline, conn.is_ready())
                        .await
                        .map_err(|_| exhausted())?;
                    if ready {
                        self.inner.lock_state().total_reused += 1;
                        return Ok(conn);
                    }
                    debug!(route = %route, "Idle connection went stale, discarding");
                    conn.give_back(false);
                }
                Err(reservation) => {
                    let sender = self.inner.connector.connect(route).await.map_err(|e| {
                        warn!(route = %route, error = %e, "Failed to open connection");
                        e
                    })?;
                    debug!(route = %route, "Created new connection");
                    return Ok(reservation.fulfil(sender));
                }
            }
        }
    }

    /// Wait until either an idle connection or a free slot is available
    async fn wait_for_checkout(
        &self,
        route: &Route,
    ) -> Result<PooledConnection, SlotReservation> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut closed = Vec::new();
            let checkout = self
                .inner
                .lock_state()
                .try_checkout(route, &self.inner.config, &mut closed);

            if !closed.is_empty() {
                drop(closed);
                self.inner.available.notify_waiters();
            }

            match checkout {
                Some(Checkout::Idle(conn)) => {
                    debug!(
                        route = %route,
                        use_count = conn.use_count,
                        age_secs = conn.created_at.elapsed().as_secs(),
                        "Reusing connection"
                    );
                    return Ok(PooledConnection {
                        inner: Arc::clone(&self.inner),
                        route: route.clone(),
                        sender: Some(conn.sender),
                        created_at: conn.created_at,
                        use_count: conn.use_count,
                        reused: true,
                    });
                }
                Some(Checkout::Reserved) => {
                    return Err(SlotReservation {
                        inner: Arc::clone(&self.inner),
                        route: route.clone(),
                        armed: true,
                    });
                }
                None => notified.await,
            }
        }
    }

    /// Return a connection after use
    ///
    /// A reusable connection that is still open goes back to the idle set of
    /// its route; anything else is closed and its slot freed.
    pub fn release(&self, mut conn: PooledConnection, reusable: bool) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &conn.inner),
            "connection released to a pool it was not acquired from"
        );
        conn.give_back(reusable);
    }

    /// Close idle connections past the idle timeout, returning how many were closed
    pub fn evict_idle(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Get statistics for the whole pool
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        let idle = state.routes.values().map(|p| p.idle.len()).sum();
        PoolStats {
            open: state.open,
            leased: state.open - idle,
            idle,
            total_created: state.total_created,
            total_reused: state.total_reused,
            total_discarded: state.total_discarded,
            total_evicted: state.total_evicted,
        }
    }

    /// Get statistics for one route
    pub fn route_stats(&self, route: &Route) -> RouteStats {
        let state = self.inner.lock_state();
        state
            .routes
            .get(route)
            .map(|p| RouteStats {
                open: p.open,
                leased: p.open - p.idle.len(),
                idle: p.idle.len(),
            })
            .unwrap_or_default()
    }

    /// Start background eviction task
    fn start_eviction_task(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime, idle connections are only checked on checkout");
            return;
        };

        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.eviction_interval;

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    debug!("Connection pool dropped, stopping idle sweep");
                    break;
                };
                inner.evict_expired();
            }
        });
    }
}
