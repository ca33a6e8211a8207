//! Guard returned by [`Pool::acquire`](crate::Pool::acquire).

use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{PoolError, Result};
use crate::lifecycle::{Session, SessionId, SessionMetadata};
use crate::pool::PoolInner;

/// A session borrowed from the pool.
///
/// When dropped, the session is returned to the pool that issued it. Use
/// [`release()`](PooledSession::release) to return it early; after that,
/// [`get()`](PooledSession::get) fails with [`PoolError::InvalidHandle`].
///
/// The guard holds only a weak reference to the pool. If the pool is gone by
/// the time the guard is released, the session is closed instead.
pub struct PooledSession<S: Session> {
    pool: Weak<PoolInner<S>>,
    session: Option<Arc<S>>,
    meta: SessionMetadata,
}

impl<S: Session> PooledSession<S> {
    pub(crate) fn new(pool: Weak<PoolInner<S>>, session: Arc<S>, meta: SessionMetadata) -> Self {
        Self {
            pool,
            session: Some(session),
            meta,
        }
    }

    /// Borrow the underlying session.
    pub fn get(&self) -> Result<&S> {
        self.session.as_deref().ok_or(PoolError::InvalidHandle)
    }

    /// Borrow the shared handle to the underlying session.
    pub fn shared(&self) -> Result<&Arc<S>> {
        self.session.as_ref().ok_or(PoolError::InvalidHandle)
    }

    /// Identity of the borrowed session.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.meta.id
    }

    /// Bookkeeping captured when the session was checked out.
    #[must_use]
    pub fn metadata(&self) -> &SessionMetadata {
        &self.meta
    }

    /// Whether the session has already been returned.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }

    /// Return the session to the pool now.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub fn release(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        match self.pool.upgrade() {
            Some(pool) => pool.release(self.meta.id),
            None => {
                tracing::debug!(session_id = %self.meta.id, "pool dropped, closing session");
                session.close();
                Ok(())
            }
        }
    }

    /// Replace this guard's session with the one held by `other`.
    ///
    /// The session currently held is released first. Both guards must come
    /// from the same pool; otherwise this fails with
    /// [`PoolError::CrossPoolTransfer`], leaves `self` untouched, and `other`
    /// is released back into its own pool.
    pub fn assign(&mut self, mut other: PooledSession<S>) -> Result<()> {
        if !Weak::ptr_eq(&self.pool, &other.pool) {
            tracing::error!(
                target_session = %self.meta.id,
                source_session = %other.meta.id,
                "attempted to move a pooled session between pools"
            );
            return Err(PoolError::CrossPoolTransfer);
        }

        let released = self.release();
        self.session = other.session.take();
        self.meta = other.meta;
        released
    }

    /// Take the session out of the pool.
    ///
    /// Its slot is freed immediately and the caller becomes responsible for
    /// closing it.
    pub fn detach(mut self) -> Result<Arc<S>> {
        let session = self.session.take().ok_or(PoolError::InvalidHandle)?;
        if let Some(pool) = self.pool.upgrade() {
            pool.detach(self.meta.id)?;
        }
        Ok(session)
    }
}

impl<S: Session> Drop for PooledSession<S> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!(session_id = %self.meta.id, error = %e, "failed to return session to pool");
        }
    }
}

impl<S: Session> fmt::Debug for PooledSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.meta.id)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}
