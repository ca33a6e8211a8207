//! # session-pool
//!
//! Bounded pool of reusable database sessions with background heartbeats.
//!
//! The pool hands out expensive-to-create sessions to concurrent callers,
//! never holding more than `max_connections` at once. Sessions are created
//! lazily through a user-supplied initializer, reused in preference to
//! creating new ones, and returned automatically when the guard is dropped.
//!
//! ## Features
//!
//! - Lazy creation up to a runtime-adjustable cap
//! - Acquire timeouts with wake-on-release
//! - Disconnected sessions are discarded on release, never recycled
//! - Heartbeat thread probes idle sessions and evicts dead ones
//! - Shutdown that waits for every borrowed session to come back
//! - Point-in-time statistics and cumulative metrics
//!
//! The factory and heartbeat probes never run while the pool lock is held,
//! so a slow connect or probe does not block releases from other threads.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use session_pool::{Pool, PoolConfig};
//!
//! let pool = Pool::new(
//!     PoolConfig::new()
//!         .max_connections(4)
//!         .acquire_timeout(Duration::from_secs(2))
//!         .heartbeat_interval(Duration::from_secs(30)),
//! )?;
//! pool.set_session_initializer(|| PgSession::connect("postgres://localhost/app"));
//!
//! let session = pool.acquire()?;
//! session.get()?.query("SELECT now()")?;
//! drop(session); // back in the pool
//!
//! let stats = pool.stat();
//! println!("{} idle / {} active", stats.idle, stats.active);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod guard;
mod heartbeat;
pub mod lifecycle;
pub mod pool;
pub mod stats;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::{BoxError, PoolError, Result};

// Pool types
pub use guard::PooledSession;
pub use pool::{Pool, PoolBuilder};
pub use stats::{PoolMetrics, PoolStats};

// Lifecycle management
pub use lifecycle::{
    HealthCheckResult, Session, SessionFactory, SessionId, SessionMetadata, SessionState,
};
