//! Session abstraction and pooled session bookkeeping.
//!
//! The pool never talks to a database directly. It manages values that
//! implement [`Session`], created on demand by a [`SessionFactory`], and
//! tracks each one with its [`SessionMetadata`] while it is pooled.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BoxError;

/// A live database session managed by the pool.
///
/// Sessions are shared between the pool and the guard that borrowed them,
/// so every method takes `&self`. Drivers with mutable connection state keep
/// it behind their own interior mutability.
pub trait Session: Send + Sync + 'static {
    /// Error type reported by the driver.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the session.
    fn open(&self) -> Result<(), Self::Error>;

    /// Close the session. Must be safe to call on an already-closed session.
    fn close(&self);

    /// Whether the session still believes it is connected.
    fn is_connected(&self) -> bool;

    /// Execute a statement, discarding any result set.
    fn query(&self, text: &str) -> Result<(), Self::Error>;
}

/// Produces new sessions for the pool.
///
/// Implemented for any `Fn() -> Result<S, E>` closure, so most callers pass a
/// closure to [`Pool::set_session_initializer`](crate::Pool::set_session_initializer).
pub trait SessionFactory<S>: Send + Sync {
    /// Create a new session. The pool opens it if it is not already connected.
    fn create(&self) -> Result<S, BoxError>;
}

impl<S, E, F> SessionFactory<S> for F
where
    F: Fn() -> Result<S, E> + Send + Sync,
    E: Into<BoxError>,
{
    fn create(&self) -> Result<S, BoxError> {
        self().map_err(Into::into)
    }
}

/// Opaque identity of a pooled session, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric identity.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// In the idle collection and available for checkout.
    Idle,
    /// Checked out by a caller.
    Active,
    /// In the idle collection while a heartbeat probe runs against it.
    PendingHeartbeat,
    /// Failed a probe and is about to be removed.
    Canceled,
}

impl SessionState {
    /// Whether a session in this state may be handed out by `acquire()`.
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether a session in this state belongs in the idle collection.
    #[must_use]
    pub fn is_idle_collection(self) -> bool {
        matches!(self, Self::Idle | Self::PendingHeartbeat | Self::Canceled)
    }
}

/// Bookkeeping for a pooled session.
#[derive(Debug, Clone, Copy)]
pub struct SessionMetadata {
    /// Session identity.
    pub id: SessionId,
    /// When the session was created.
    pub created_at: Instant,
    /// Last time the session was created, released or successfully probed.
    pub last_heartbeat: Instant,
    /// Last time the session was checked out.
    pub last_checkout: Option<Instant>,
    /// Number of times the session has been checked out.
    pub checkout_count: u64,
    /// Current lifecycle state.
    pub state: SessionState,
}

impl SessionMetadata {
    pub(crate) fn new(id: SessionId, state: SessionState) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_heartbeat: now,
            last_checkout: None,
            checkout_count: 0,
            state,
        }
    }

    /// Time since the session was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last heartbeat refresh.
    #[must_use]
    pub fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }
}

/// Outcome of a single heartbeat probe.
#[derive(Debug)]
pub enum HealthCheckResult {
    /// The probe succeeded.
    Healthy {
        /// How long the probe took.
        latency: Duration,
    },
    /// The probe failed.
    Failed {
        /// Error reported by the driver.
        error: BoxError,
    },
}

impl HealthCheckResult {
    /// Run `statement` against `session` and classify the outcome.
    pub fn probe<S: Session>(session: &S, statement: &str) -> Self {
        let started = Instant::now();
        match session.query(statement) {
            Ok(()) => Self::Healthy {
                latency: started.elapsed(),
            },
            Err(e) => Self::Failed { error: Box::new(e) },
        }
    }

    /// Whether the probe succeeded.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// A session owned by the pool together with its bookkeeping.
pub(crate) struct PooledRecord<S> {
    pub(crate) session: Arc<S>,
    pub(crate) meta: SessionMetadata,
}

impl<S: Session> PooledRecord<S> {
    pub(crate) fn new_active(id: SessionId, session: Arc<S>) -> Self {
        let mut meta = SessionMetadata::new(id, SessionState::Active);
        meta.last_checkout = Some(meta.created_at);
        meta.checkout_count = 1;
        Self { session, meta }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.meta.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.meta.state
    }

    pub(crate) fn checkout(&mut self) {
        debug_assert!(
            self.meta.state.is_available(),
            "checkout of session {} in state {:?}",
            self.meta.id,
            self.meta.state
        );
        self.meta.state = SessionState::Active;
        self.meta.last_checkout = Some(Instant::now());
        self.meta.checkout_count += 1;
    }

    pub(crate) fn checkin(&mut self) {
        debug_assert!(
            !self.meta.state.is_idle_collection(),
            "checkin of session {} that is already idle",
            self.meta.id
        );
        self.meta.state = SessionState::Idle;
        self.meta.last_heartbeat = Instant::now();
    }

    /// Whether the session is idle and has gone longer than `interval` without a heartbeat.
    pub(crate) fn heartbeat_due(&self, interval: Duration) -> bool {
        self.meta.state == SessionState::Idle && self.meta.since_heartbeat() > interval
    }

    pub(crate) fn begin_heartbeat(&mut self) {
        debug_assert!(self.meta.state.is_available());
        self.meta.state = SessionState::PendingHeartbeat;
    }

    pub(crate) fn complete_heartbeat(&mut self, result: &HealthCheckResult) {
        debug_assert!(self.meta.state.is_idle_collection());
        if result.is_healthy() {
            self.meta.state = SessionState::Idle;
            self.meta.last_heartbeat = Instant::now();
        } else {
            self.meta.state = SessionState::Canceled;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("probe refused")]
    struct Refused;

    struct FlakySession {
        healthy: AtomicBool,
    }

    impl Session for FlakySession {
        type Error = Refused;

        fn open(&self) -> Result<(), Refused> {
            Ok(())
        }

        fn close(&self) {}

        fn is_connected(&self) -> bool {
            true
        }

        fn query(&self, _text: &str) -> Result<(), Refused> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Refused)
            }
        }
    }

    fn record() -> PooledRecord<FlakySession> {
        PooledRecord::new_active(
            SessionId::new(1),
            Arc::new(FlakySession {
                healthy: AtomicBool::new(true),
            }),
        )
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Idle.is_available());
        assert!(!SessionState::PendingHeartbeat.is_available());
        assert!(!SessionState::Active.is_available());
        assert!(!SessionState::Canceled.is_available());

        assert!(SessionState::PendingHeartbeat.is_idle_collection());
        assert!(!SessionState::Active.is_idle_collection());
    }

    #[test]
    fn test_record_checkout_cycle() {
        let mut rec = record();
        assert_eq!(rec.state(), SessionState::Active);
        assert_eq!(rec.meta.checkout_count, 1);

        rec.checkin();
        assert_eq!(rec.state(), SessionState::Idle);

        rec.checkout();
        assert_eq!(rec.state(), SessionState::Active);
        assert_eq!(rec.meta.checkout_count, 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "checkout of session #1 in state PendingHeartbeat")]
    fn test_checkout_while_probing_is_rejected() {
        let mut rec = record();
        rec.checkin();
        rec.begin_heartbeat();
        rec.checkout();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already idle")]
    fn test_double_checkin_is_rejected() {
        let mut rec = record();
        rec.checkin();
        rec.checkin();
    }

    #[test]
    fn test_heartbeat_due_only_when_idle() {
        let mut rec = record();
        assert!(!rec.heartbeat_due(Duration::ZERO));

        rec.checkin();
        std::thread::sleep(Duration::from_millis(5));
        assert!(rec.heartbeat_due(Duration::from_millis(1)));
        assert!(!rec.heartbeat_due(Duration::from_secs(60)));

        rec.begin_heartbeat();
        assert!(!rec.heartbeat_due(Duration::ZERO));
    }

    #[test]
    fn test_probe_outcomes() {
        let mut rec = record();
        rec.checkin();
        rec.begin_heartbeat();

        let ok = HealthCheckResult::probe(rec.session.as_ref(), "SELECT 1");
        assert!(ok.is_healthy());
        rec.complete_heartbeat(&ok);
        assert_eq!(rec.state(), SessionState::Idle);

        rec.session.healthy.store(false, Ordering::SeqCst);
        rec.begin_heartbeat();
        let failed = HealthCheckResult::probe(rec.session.as_ref(), "SELECT 1");
        assert!(!failed.is_healthy());
        rec.complete_heartbeat(&failed);
        assert_eq!(rec.state(), SessionState::Canceled);
    }

    #[test]
    fn test_closure_factory() {
        let factory = || -> Result<FlakySession, Refused> {
            Ok(FlakySession {
                healthy: AtomicBool::new(true),
            })
        };
        assert!(SessionFactory::<FlakySession>::create(&factory).is_ok());

        let failing = || -> Result<FlakySession, Refused> { Err(Refused) };
        let err = SessionFactory::<FlakySession>::create(&failing).err().map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("probe refused"));
    }
}
