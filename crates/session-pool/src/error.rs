//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::SessionId;

/// Boxed error produced by session factories and drivers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the pool.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur while using the pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No session became available within the acquire timeout.
    #[error("timed out after {timeout:?} waiting for a pooled session")]
    AcquireTimeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The session factory failed to produce an open session.
    #[error("session factory failed: {0}")]
    SessionFactory(#[source] BoxError),

    /// A release named a session that is not checked out from this pool.
    #[error("session {id} is not checked out from this pool")]
    NoSuchConnection {
        /// Identity passed to the release.
        id: SessionId,
    },

    /// A guard was assigned a guard issued by a different pool.
    #[error("cannot transfer a pooled session between pools")]
    CrossPoolTransfer,

    /// The guard no longer holds a session.
    #[error("pooled session handle has already been released")]
    InvalidHandle,

    /// The pool has been shut down.
    #[error("pool is closed")]
    PoolClosed,

    /// `acquire()` was called before a session initializer was set.
    #[error("no session initializer configured")]
    NoSessionInitializer,

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// IO error, such as failing to spawn the heartbeat thread.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Whether the error reflects an environmental condition the caller may retry.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AcquireTimeout { .. } | Self::SessionFactory(_))
    }

    /// Whether the error indicates misuse of the pool API by the caller.
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::NoSuchConnection { .. } | Self::CrossPoolTransfer | Self::InvalidHandle
        )
    }
}
