//! # session-pool-testing
//!
//! Test infrastructure for the session pool.
//!
//! Provides an in-memory [`MockSession`] with fault injection, a
//! [`MockFactory`] that records every session it creates, and small helpers
//! for the timing-sensitive tests in this crate's `tests/` directory.
//!
//! ```rust,ignore
//! use session_pool::PoolConfig;
//! use session_pool_testing::mock_pool;
//!
//! let (pool, factory) = mock_pool(PoolConfig::new().max_connections(2));
//! let session = pool.acquire()?;
//! factory.session(1).unwrap().kill();
//! drop(session); // discarded, not recycled
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;

use std::time::{Duration, Instant};

use session_pool::{Pool, PoolConfig};

pub use mock::{MockError, MockFactory, MockSession, MockState};

/// Build a pool of mock sessions and return it with its factory.
///
/// # Panics
///
/// Panics if `config` is invalid.
pub fn mock_pool(config: PoolConfig) -> (Pool<MockSession>, MockFactory) {
    mock_pool_with(config, MockFactory::new())
}

/// Build a pool of mock sessions around an existing factory.
///
/// # Panics
///
/// Panics if `config` is invalid.
#[allow(clippy::expect_used)]
pub fn mock_pool_with(config: PoolConfig, factory: MockFactory) -> (Pool<MockSession>, MockFactory) {
    let pool = Pool::new(config).expect("invalid test pool configuration");
    pool.set_session_initializer(factory.initializer());
    (pool, factory)
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
