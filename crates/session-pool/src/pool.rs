//! Pool core: session collections, acquire/release and shutdown.
//!
//! The pool keeps every session it owns in exactly one of two collections,
//! `active` (checked out) or `idle` (available or being probed). Both live
//! behind one `RwLock`. Slow work, namely creating a session and running
//! heartbeat probes, always happens with that lock released, so decisions
//! made before the slow step are re-validated afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::PoolConfig;
use crate::error::{BoxError, PoolError, Result};
use crate::guard::PooledSession;
use crate::heartbeat::HeartbeatHandle;
use crate::lifecycle::{PooledRecord, Session, SessionFactory, SessionId, SessionMetadata};
use crate::stats::{PoolMetrics, PoolMetricsInner, PoolStats};

/// A bounded pool of reusable database sessions.
///
/// Sessions are created lazily by the configured initializer, up to
/// `max_connections`, and handed out as [`PooledSession`] guards that return
/// them on drop. A background thread probes idle sessions with the heartbeat
/// query and evicts the ones that fail.
///
/// Dropping the pool shuts it down, which blocks until every borrowed
/// session has been returned (or `shutdown_timeout` elapses).
///
/// # Example
///
/// ```rust,ignore
/// use std::time::Duration;
/// use session_pool::Pool;
///
/// let pool = Pool::builder()
///     .max_connections(8)
///     .acquire_timeout(Duration::from_secs(5))
///     .heartbeat_interval(Duration::from_secs(30))
///     .session_initializer(|| MySession::connect("db.internal:5432"))
///     .build()?;
///
/// let session = pool.acquire()?;
/// session.get()?.query("UPDATE jobs SET state = 'done' WHERE id = 7")?;
/// // Returned to the pool here.
/// ```
pub struct Pool<S: Session> {
    inner: Arc<PoolInner<S>>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    /// Set once the first `shutdown()` call has finished draining.
    shut_down: Mutex<bool>,
    shutdown_done: Condvar,
}

/// State shared between the pool handle, its guards and the heartbeat thread.
pub(crate) struct PoolInner<S: Session> {
    /// Live configuration, mutable at runtime.
    pub(crate) config: RwLock<PoolConfig>,

    factory: RwLock<Option<Arc<dyn SessionFactory<S>>>>,

    /// Session collections.
    pub(crate) state: RwLock<PoolState<S>>,

    /// Release epoch, bumped on every release, eviction or freed slot.
    released: Mutex<u64>,

    /// Signalled together with `released`.
    available: Condvar,

    /// Whether the pool is closed.
    closed: AtomicBool,

    /// Counter for generating session IDs.
    next_session_id: AtomicU64,

    /// Successful heartbeat probes since the last reset.
    pub(crate) heartbeats: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    pub(crate) metrics: Mutex<PoolMetricsInner>,
}

pub(crate) struct PoolState<S> {
    pub(crate) active: HashMap<SessionId, PooledRecord<S>>,
    pub(crate) idle: BTreeMap<SessionId, PooledRecord<S>>,
    /// Slots reserved by acquirers currently running the factory.
    creating: u32,
}

impl<S> PoolState<S> {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            idle: BTreeMap::new(),
            creating: 0,
        }
    }

    fn total(&self) -> usize {
        self.active.len() + self.idle.len()
    }
}

/// Outcome of one locked checkout decision.
enum Checkout<S> {
    Reused(Arc<S>, SessionMetadata),
    Reserved,
    Saturated,
}

/// A reserved creation slot, returned to the pool unless the new session is inserted.
struct Reservation<'a, S: Session> {
    inner: &'a PoolInner<S>,
    armed: bool,
}

impl<S: Session> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.write().creating -= 1;
            self.inner.notify_released();
        }
    }
}

impl<S: Session> Pool<S> {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder<S> {
        PoolBuilder::new()
    }

    /// Create a new pool with the given configuration.
    ///
    /// A session initializer must be set with
    /// [`set_session_initializer`](Self::set_session_initializer) before the
    /// first session can be created.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            max = config.max_connections,
            acquire_timeout = ?config.acquire_timeout,
            heartbeat_interval = ?config.heartbeat_interval,
            "session pool created"
        );

        let inner = Arc::new(PoolInner {
            config: RwLock::new(config),
            factory: RwLock::new(None),
            state: RwLock::new(PoolState::new()),
            released: Mutex::new(0),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
            heartbeats: AtomicU64::new(0),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        });

        let heartbeat = HeartbeatHandle::spawn(Arc::downgrade(&inner))?;

        Ok(Self {
            inner,
            heartbeat: Mutex::new(Some(heartbeat)),
            shut_down: Mutex::new(false),
            shutdown_done: Condvar::new(),
        })
    }

    /// Set the maximum number of sessions.
    ///
    /// Takes effect on the next acquisition decision. Existing sessions above
    /// a lowered cap are not closed.
    pub fn set_max_connections(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(PoolError::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        self.inner.config.write().max_connections = count;
        self.inner.notify_released();
        Ok(())
    }

    /// Set how long `acquire()` waits for a session.
    pub fn set_acquire_timeout(&self, timeout: Duration) {
        self.inner.config.write().acquire_timeout = timeout;
    }

    /// Set the function used to create new sessions.
    pub fn set_session_initializer<F>(&self, factory: F)
    where
        F: SessionFactory<S> + 'static,
    {
        *self.inner.factory.write() = Some(Arc::new(factory));
    }

    /// Set the heartbeat interval. `Duration::ZERO` disables heartbeats.
    pub fn set_heartbeat_interval(&self, interval: Duration) {
        self.inner.config.write().heartbeat_interval = interval;
    }

    /// Set the statement used to probe idle sessions.
    pub fn set_heartbeat_query(&self, query: impl Into<String>) -> Result<()> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(PoolError::Config("heartbeat_query cannot be empty".into()));
        }
        self.inner.config.write().heartbeat_query = query;
        Ok(())
    }

    /// Get a session from the pool.
    ///
    /// Returns an idle session if one exists, creates a new one if the pool is
    /// under `max_connections`, and otherwise waits up to the configured
    /// acquire timeout for a session to be released.
    pub fn acquire(&self) -> Result<PooledSession<S>> {
        let timeout = self.inner.config.read().acquire_timeout;
        self.acquire_timeout(timeout)
    }

    /// Get a session from the pool, waiting at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledSession<S>> {
        match self.checkout(Some(timeout)) {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(PoolError::AcquireTimeout { timeout }),
            Err(e) => Err(e),
        }
    }

    /// Try to get a session without waiting.
    ///
    /// Returns `None` if the pool is saturated. May still create a new session
    /// when the pool is under its cap.
    pub fn try_acquire(&self) -> Result<Option<PooledSession<S>>> {
        self.checkout(None)
    }

    /// Run the acquire loop. `None` means do not wait at all.
    fn checkout(&self, timeout: Option<Duration>) -> Result<Option<PooledSession<S>>> {
        let started = Instant::now();
        let deadline = timeout.and_then(|t| started.checked_add(t));

        tracing::trace!("acquiring session from pool");

        loop {
            if self.inner.is_closed() {
                self.inner.metrics.lock().checkouts_failed += 1;
                return Err(PoolError::PoolClosed);
            }

            // Read before deciding so a release racing the decision is not missed.
            let epoch = *self.inner.released.lock();

            match self.inner.try_checkout() {
                Checkout::Reused(session, meta) => {
                    self.inner.metrics.lock().checkouts_successful += 1;
                    tracing::trace!(session_id = %meta.id, "reusing idle session");
                    return Ok(Some(self.guard(session, meta)));
                }
                Checkout::Reserved => {
                    let reservation = Reservation {
                        inner: &self.inner,
                        armed: true,
                    };
                    return self.create_session(reservation).map(Some);
                }
                Checkout::Saturated => {}
            }

            let Some(timeout) = timeout else {
                return Ok(None);
            };

            if !self.inner.wait_for_release(epoch, deadline) {
                self.inner.metrics.lock().checkouts_failed += 1;
                tracing::debug!(
                    timeout = ?timeout,
                    waited = ?started.elapsed(),
                    "timed out waiting for a pooled session"
                );
                return Ok(None);
            }
        }
    }

    /// Create a session into a reserved slot. Runs without the state lock.
    fn create_session(&self, mut reservation: Reservation<'_, S>) -> Result<PooledSession<S>> {
        let factory = self.inner.factory.read().clone();
        let Some(factory) = factory else {
            self.inner.metrics.lock().checkouts_failed += 1;
            return Err(PoolError::NoSessionInitializer);
        };

        let session = match open_session(factory.as_ref()) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.inner.metrics.lock().checkouts_failed += 1;
                tracing::warn!(error = %e, "session factory failed");
                return Err(PoolError::SessionFactory(e));
            }
        };

        let id = self.inner.next_session_id();
        let record = PooledRecord::new_active(id, Arc::clone(&session));
        let meta = record.meta;

        {
            let mut state = self.inner.state.write();
            state.creating -= 1;
            reservation.armed = false;

            if self.inner.is_closed() {
                drop(state);
                self.inner.notify_released();
                session.close();
                let mut metrics = self.inner.metrics.lock();
                metrics.connections_created += 1;
                metrics.connections_closed += 1;
                metrics.checkouts_failed += 1;
                return Err(PoolError::PoolClosed);
            }

            state.active.insert(id, record);
        }

        {
            let mut metrics = self.inner.metrics.lock();
            metrics.connections_created += 1;
            metrics.checkouts_successful += 1;
        }

        tracing::debug!(session_id = %id, "created new pooled session");

        Ok(self.guard(session, meta))
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<PoolInner<S>> {
        &self.inner
    }

    fn guard(&self, session: Arc<S>, meta: SessionMetadata) -> PooledSession<S> {
        PooledSession::new(Arc::downgrade(&self.inner), session, meta)
    }

    /// Snapshot of the pool's collections.
    #[must_use]
    pub fn stat(&self) -> PoolStats {
        let max = self.inner.config.read().max_connections;
        let state = self.inner.state.read();
        PoolStats {
            total: to_u32(state.total()),
            active: to_u32(state.active.len()),
            idle: to_u32(state.idle.len()),
            heartbeats: self.heartbeats_count(),
            max,
        }
    }

    /// Number of sessions owned by the pool, idle or active.
    #[must_use]
    pub fn num_connections(&self) -> usize {
        self.inner.state.read().total()
    }

    /// Number of sessions currently checked out.
    #[must_use]
    pub fn num_active_connections(&self) -> usize {
        self.inner.state.read().active.len()
    }

    /// Number of sessions in the idle collection, including ones being probed.
    #[must_use]
    pub fn num_idle_connections(&self) -> usize {
        self.inner.state.read().idle.len()
    }

    /// Number of successful heartbeat probes since the last reset.
    #[must_use]
    pub fn heartbeats_count(&self) -> u64 {
        self.inner.heartbeats.load(Ordering::Acquire)
    }

    /// Reset the heartbeat counter to zero.
    pub fn reset_heartbeats_counter(&self) {
        self.inner.heartbeats.store(0, Ordering::Release);
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics::from_inner(&inner, self.inner.created_at.elapsed())
    }

    /// Get a copy of the live pool configuration.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.inner.config.read().clone()
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Shut the pool down.
    ///
    /// Stops the heartbeat thread, closes idle sessions, wakes waiting
    /// acquirers (which fail with [`PoolError::PoolClosed`]) and then blocks
    /// until every borrowed session has been returned and closed.
    ///
    /// Later or concurrent calls do no work of their own but block until the
    /// first call has finished, so every caller returns after the drain.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            let mut shut_down = self.shut_down.lock();
            while !*shut_down {
                self.shutdown_done.wait(&mut shut_down);
            }
            return;
        }

        tracing::info!("shutting down session pool");

        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
        }

        self.inner.notify_released();

        let idle: Vec<_> = {
            let mut state = self.inner.state.write();
            std::mem::take(&mut state.idle).into_values().collect()
        };
        for record in &idle {
            record.session.close();
        }
        self.inner.metrics.lock().connections_closed += idle.len() as u64;

        let (poll, limit) = {
            let config = self.inner.config.read();
            (config.shutdown_poll_interval, config.shutdown_timeout)
        };
        let started = Instant::now();

        loop {
            let outstanding = {
                let state = self.inner.state.read();
                state.active.len() + state.creating as usize
            };
            if outstanding == 0 {
                break;
            }
            if limit.is_some_and(|limit| started.elapsed() >= limit) {
                tracing::warn!(
                    outstanding,
                    "shutdown timed out waiting for borrowed sessions"
                );
                break;
            }
            std::thread::sleep(poll);
        }

        tracing::info!(closed_idle = idle.len(), "session pool shut down");

        *self.shut_down.lock() = true;
        self.shutdown_done.notify_all();
    }
}

impl<S: Session> Drop for Pool<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: Session> PoolInner<S> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Decide, under the state lock, how to satisfy one acquire attempt.
    fn try_checkout(&self) -> Checkout<S> {
        let max = self.config.read().max_connections as usize;
        let mut state = self.state.write();

        let available = state
            .idle
            .iter()
            .find(|(_, record)| record.state().is_available())
            .map(|(id, _)| *id);

        if let Some(mut record) = available.and_then(|id| state.idle.remove(&id)) {
            record.checkout();
            let session = Arc::clone(&record.session);
            let meta = record.meta;
            state.active.insert(meta.id, record);
            return Checkout::Reused(session, meta);
        }

        if state.total() + (state.creating as usize) < max {
            state.creating += 1;
            return Checkout::Reserved;
        }

        Checkout::Saturated
    }

    /// Block until the release epoch moves past `epoch` or `deadline` passes.
    ///
    /// Returns `false` on timeout.
    fn wait_for_release(&self, epoch: u64, deadline: Option<Instant>) -> bool {
        let mut released = self.released.lock();
        while *released == epoch {
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut released, deadline).timed_out() {
                        return *released != epoch;
                    }
                }
                None => self.available.wait(&mut released),
            }
        }
        true
    }

    /// Wake every waiting acquirer so it re-checks the pool.
    pub(crate) fn notify_released(&self) {
        {
            let mut released = self.released.lock();
            *released = released.wrapping_add(1);
        }
        self.available.notify_all();
    }

    /// Return a checked-out session to the pool.
    ///
    /// A session that no longer reports itself connected, or any session
    /// returned after shutdown began, is closed instead of becoming idle.
    pub(crate) fn release(&self, id: SessionId) -> Result<()> {
        let discarded = {
            let mut state = self.state.write();
            let removed = state.active.remove(&id);
            if removed.is_none() {
                tracing::error!(session_id = %id, "released a session not checked out from this pool");
            }
            debug_assert!(
                removed.is_some(),
                "release of session {id} not checked out from this pool"
            );
            let Some(mut record) = removed else {
                return Err(PoolError::NoSuchConnection { id });
            };

            if !self.is_closed() && record.session.is_connected() {
                record.checkin();
                state.idle.insert(id, record);
                None
            } else {
                Some(record)
            }
        };

        if let Some(record) = discarded {
            let closing = self.is_closed();
            record.session.close();

            let mut metrics = self.metrics.lock();
            metrics.connections_closed += 1;
            if !closing {
                metrics.evictions += 1;
            }
            drop(metrics);

            if closing {
                tracing::trace!(session_id = %id, "closed session returned during shutdown");
            } else {
                tracing::debug!(session_id = %id, "discarded disconnected session on release");
            }
        } else {
            tracing::trace!(session_id = %id, "returned session to pool");
        }

        self.notify_released();
        Ok(())
    }

    /// Remove a checked-out session from the pool without closing it.
    pub(crate) fn detach(&self, id: SessionId) -> Result<()> {
        let removed = self.state.write().active.remove(&id);
        if removed.is_none() {
            tracing::error!(session_id = %id, "detached a session not checked out from this pool");
        }
        debug_assert!(
            removed.is_some(),
            "detach of session {id} not checked out from this pool"
        );
        if removed.is_none() {
            return Err(PoolError::NoSuchConnection { id });
        }

        tracing::debug!(session_id = %id, "detached session from pool");
        self.notify_released();
        Ok(())
    }
}

/// Invoke the factory and make sure the result is open.
fn open_session<S: Session>(factory: &dyn SessionFactory<S>) -> std::result::Result<S, BoxError> {
    let session = factory.create()?;
    if !session.is_connected() {
        session.open().map_err(|e| Box::new(e) as BoxError)?;
    }
    Ok(session)
}

fn to_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Builder for creating a session pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .max_connections(4)
///     .heartbeat_interval(Duration::from_secs(10))
///     .session_initializer(|| MySession::connect(&url))
///     .build()?;
/// ```
pub struct PoolBuilder<S: Session> {
    pool_config: PoolConfig,
    factory: Option<Arc<dyn SessionFactory<S>>>,
}

impl<S: Session> PoolBuilder<S> {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            factory: None,
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.acquire_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.pool_config.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat probe statement.
    #[must_use]
    pub fn heartbeat_query(mut self, query: impl Into<String>) -> Self {
        self.pool_config.heartbeat_query = query.into();
        self
    }

    /// Set the nominal and busy sleeps of the heartbeat loop.
    #[must_use]
    pub fn heartbeat_ticks(mut self, nominal: Duration, busy: Duration) -> Self {
        self.pool_config.heartbeat_tick = nominal;
        self.pool_config.heartbeat_busy_tick = busy;
        self
    }

    /// Bound how long shutdown waits for borrowed sessions.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.shutdown_timeout = Some(timeout);
        self
    }

    /// Set the function used to create new sessions.
    #[must_use]
    pub fn session_initializer<F>(mut self, factory: F) -> Self
    where
        F: SessionFactory<S> + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool<S>> {
        let pool = Pool::new(self.pool_config)?;
        if self.factory.is_some() {
            *pool.inner.factory.write() = self.factory;
        }
        Ok(pool)
    }
}

impl<S: Session> Default for PoolBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
