//! In-memory session and instrumented factory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use session_pool::Session;
use thiserror::Error;

/// Errors reported by [`MockSession`] and [`MockFactory`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockError {
    /// The factory was told to refuse this connection attempt.
    #[error("connection refused by mock server")]
    ConnectRefused,

    /// The session was told to fail its queries.
    #[error("query failed on session {0}")]
    QueryFailed(u32),

    /// The session has been closed or killed.
    #[error("session {0} is not connected")]
    NotConnected(u32),
}

/// Observable state of one mock session, shared with the test.
#[derive(Debug)]
pub struct MockState {
    serial: u32,
    connected: AtomicBool,
    fail_queries: AtomicBool,
    query_delay: Mutex<Duration>,
    in_query: AtomicU32,
    opens: AtomicU32,
    closes: AtomicU32,
    statements: Mutex<Vec<String>>,
}

impl MockState {
    fn new(serial: u32) -> Self {
        Self {
            serial,
            connected: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            query_delay: Mutex::new(Duration::ZERO),
            in_query: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            statements: Mutex::new(Vec::new()),
        }
    }

    /// Creation order of the session, starting at 1.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Whether the session reports itself connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop the connection without going through `close()`.
    pub fn kill(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make every subsequent query fail while the session stays "connected".
    ///
    /// This is how a silently dropped server connection looks to a driver.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every query, simulating a slow round trip.
    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock() = delay;
    }

    /// Whether a query is executing on the session right now.
    #[must_use]
    pub fn is_querying(&self) -> bool {
        self.in_query.load(Ordering::SeqCst) > 0
    }

    /// Number of times `open()` was called.
    #[must_use]
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of times `close()` was called.
    #[must_use]
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Statements executed so far, including heartbeat probes.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Number of executed statements equal to `text`.
    #[must_use]
    pub fn count_of(&self, text: &str) -> usize {
        self.statements.lock().iter().filter(|s| *s == text).count()
    }
}

/// A [`Session`] backed by memory.
#[derive(Debug)]
pub struct MockSession {
    state: Arc<MockState>,
}

impl MockSession {
    /// Shared state, for assertions and fault injection.
    #[must_use]
    pub fn state(&self) -> &Arc<MockState> {
        &self.state
    }

    /// Creation order of the session.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.state.serial
    }
}

impl Session for MockSession {
    type Error = MockError;

    fn open(&self) -> Result<(), MockError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn query(&self, text: &str) -> Result<(), MockError> {
        self.state.statements.lock().push(text.to_string());

        let delay = *self.state.query_delay.lock();
        if !delay.is_zero() {
            self.state.in_query.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(delay);
            self.state.in_query.fetch_sub(1, Ordering::SeqCst);
        }

        if !self.state.is_connected() {
            return Err(MockError::NotConnected(self.state.serial));
        }
        if self.state.fail_queries.load(Ordering::SeqCst) {
            return Err(MockError::QueryFailed(self.state.serial));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FactoryInner {
    created: AtomicU32,
    attempts: AtomicU32,
    failures_remaining: AtomicU32,
    connect_delay: Mutex<Duration>,
    sessions: Mutex<Vec<Arc<MockState>>>,
}

/// Session factory that records everything it creates.
///
/// Cloning shares the same counters, so a clone can be moved into the pool
/// while the test keeps another.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    inner: Arc<FactoryInner>,
}

impl MockFactory {
    /// Create a new factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every creation, simulating a slow connect.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.inner.connect_delay.lock() = delay;
        self
    }

    /// Refuse the next `count` creation attempts.
    pub fn fail_next(&self, count: u32) {
        self.inner.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of sessions successfully created.
    #[must_use]
    pub fn created(&self) -> u32 {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Number of creation attempts, including refused ones.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// State of every session created so far, in creation order.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<MockState>> {
        self.inner.sessions.lock().clone()
    }

    /// State of the session with the given serial.
    #[must_use]
    pub fn session(&self, serial: u32) -> Option<Arc<MockState>> {
        self.inner
            .sessions
            .lock()
            .iter()
            .find(|s| s.serial == serial)
            .cloned()
    }

    /// Create one session. Sessions come back unopened; the pool opens them.
    pub fn create(&self) -> Result<MockSession, MockError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let refused = self
            .inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            tracing::debug!("mock factory refusing connection");
            return Err(MockError::ConnectRefused);
        }

        let serial = self.inner.created.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(MockState::new(serial));
        self.inner.sessions.lock().push(Arc::clone(&state));
        Ok(MockSession { state })
    }

    /// A closure suitable for `Pool::set_session_initializer`.
    pub fn initializer(&self) -> impl Fn() -> Result<MockSession, MockError> + Send + Sync + 'static {
        let factory = self.clone();
        move || factory.create()
    }
}
