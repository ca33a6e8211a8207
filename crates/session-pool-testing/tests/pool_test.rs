//! Acquire/release behaviour of the pool core.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use session_pool::{PoolConfig, PoolError, Session};
use session_pool_testing::{MockFactory, init_tracing, mock_pool, mock_pool_with};

fn config(max: u32) -> PoolConfig {
    PoolConfig::new()
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(5))
}

#[test]
fn test_capacity_bound_under_contention() {
    init_tracing();
    let (pool, factory) = mock_pool(config(3));
    let pool = Arc::new(pool);
    let done = Arc::new(AtomicBool::new(false));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let monitor = {
        let pool = Arc::clone(&pool);
        let done = Arc::clone(&done);
        let max_seen = Arc::clone(&max_seen);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                let stats = pool.stat();
                assert!(stats.total <= 3, "pool grew past its cap: {stats:?}");
                assert_eq!(stats.total, stats.active + stats.idle);
                max_seen.fetch_max(stats.total as usize, Ordering::SeqCst);
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..12)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..20 {
                    let session = pool.acquire().unwrap();
                    session.get().unwrap().query("SELECT 1").unwrap();
                    thread::sleep(Duration::from_micros(200));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    monitor.join().unwrap();

    assert!(factory.created() <= 3);
    assert!(max_seen.load(Ordering::SeqCst) <= 3);
    assert_eq!(pool.num_active_connections(), 0);
}

#[test]
fn test_no_double_handout() {
    let (pool, _factory) = mock_pool(config(4));
    let pool = Arc::new(pool);
    let in_use = Arc::new(Mutex::new(HashSet::new()));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            thread::spawn(move || {
                for _ in 0..50 {
                    let session = pool.acquire().unwrap();
                    let serial = session.get().unwrap().serial();
                    assert!(
                        in_use.lock().insert(serial),
                        "session {serial} handed out twice"
                    );
                    thread::sleep(Duration::from_micros(100));
                    assert!(in_use.lock().remove(&serial));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_reuse_over_creation() {
    let (pool, factory) = mock_pool(config(4));
    let first = pool.acquire().unwrap();
    let first_id = first.id();
    drop(first);
    assert_eq!(factory.created(), 1);

    let again = pool.acquire().unwrap();
    assert_eq!(again.id(), first_id);
    assert_eq!(factory.created(), 1);
    assert_eq!(again.metadata().checkout_count, 2);
}

#[test]
fn test_release_restores_idle() {
    let (pool, _factory) = mock_pool(config(2));
    let a = pool.acquire().unwrap();
    let _b = pool.acquire().unwrap();
    assert_eq!(pool.num_active_connections(), 2);
    assert_eq!(pool.num_idle_connections(), 0);

    drop(a);
    assert_eq!(pool.num_active_connections(), 1);
    assert_eq!(pool.num_idle_connections(), 1);
    assert_eq!(pool.num_connections(), 2);
}

#[test]
fn test_dead_session_not_recycled() {
    let (pool, factory) = mock_pool(config(2));
    let session = pool.acquire().unwrap();
    session.get().unwrap().close();
    drop(session);

    assert_eq!(pool.num_connections(), 0);
    assert_eq!(pool.num_idle_connections(), 0);
    assert_eq!(pool.metrics().evictions, 1);

    let fresh = pool.acquire().unwrap();
    assert_eq!(fresh.get().unwrap().serial(), 2);
    assert_eq!(factory.created(), 2);
}

#[test]
fn test_killed_session_discarded_on_release() {
    let (pool, factory) = mock_pool(config(1));
    let session = pool.acquire().unwrap();
    let state = factory.session(1).unwrap();
    state.kill();
    drop(session);

    assert_eq!(pool.num_connections(), 0);
    // Discarded sessions are still closed.
    assert_eq!(state.closes(), 1);
}

#[test]
fn test_timeout_accuracy() {
    let (pool, _factory) = mock_pool(config(1).acquire_timeout(Duration::from_millis(300)));
    let _held = pool.acquire().unwrap();

    let started = Instant::now();
    let err = pool.acquire().unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, PoolError::AcquireTimeout { timeout } if timeout == Duration::from_millis(300)));
    assert!(err.is_recoverable());
    assert!(elapsed >= Duration::from_millis(290), "returned early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(400), "returned late: {elapsed:?}");
    assert_eq!(pool.metrics().checkouts_failed, 1);
}

#[test]
fn test_zero_timeout_fails_immediately() {
    let (pool, _factory) = mock_pool(config(1));
    let _held = pool.acquire().unwrap();

    let started = Instant::now();
    let err = pool.acquire_timeout(Duration::ZERO).unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_waiter_served_after_release() {
    let (pool, _factory) = mock_pool(config(1));
    let pool = Arc::new(pool);
    let held = pool.acquire().unwrap();
    let held_id = held.id();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let session = pool.acquire();
            tx.send(session.map(|s| s.id())).unwrap();
        })
    };

    // Still blocked while the only session is out.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    let released_at = Instant::now();
    drop(held);
    let got = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert!(released_at.elapsed() < Duration::from_millis(200));
    assert_eq!(got, held_id);

    waiter.join().unwrap();
}

#[test]
fn test_two_sessions_then_third_blocks() {
    let (pool, factory) = mock_pool(config(2));
    let pool = Arc::new(pool);
    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    assert_eq!(pool.num_active_connections(), 2);
    assert_eq!(factory.created(), 2);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let session = pool.acquire().unwrap();
            tx.send(session.id()).unwrap();
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    let second_id = second.id();
    drop(second);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), second_id);
    assert_eq!(factory.created(), 2);

    waiter.join().unwrap();
    drop(first);
}

#[test]
fn test_sequential_reuse_keeps_one_session() {
    let (pool, factory) = mock_pool(config(4));
    for _ in 0..100 {
        let session = pool.acquire().unwrap();
        assert_eq!(pool.num_connections(), 1);
        session.get().unwrap().query("SELECT 1").unwrap();
        drop(session);
        assert_eq!(pool.num_connections(), 1);
    }
    assert_eq!(factory.created(), 1);
    assert_eq!(pool.metrics().checkouts_successful, 100);
}

#[test]
fn test_closed_session_drops_total() {
    let (pool, _factory) = mock_pool(config(1));
    let session = pool.acquire().unwrap();
    assert_eq!(pool.num_connections(), 1);
    session.get().unwrap().close();
    drop(session);
    assert_eq!(pool.num_connections(), 0);
}

#[test]
fn test_factory_failure_propagates() {
    let (pool, factory) = mock_pool(config(1));
    factory.fail_next(1);

    let err = pool.acquire().unwrap_err();
    match &err {
        PoolError::SessionFactory(source) => {
            assert_eq!(source.to_string(), "connection refused by mock server");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_recoverable());
    assert_eq!(pool.num_connections(), 0);

    // The cap was not consumed by the failure.
    let session = pool.acquire().unwrap();
    assert_eq!(session.get().unwrap().serial(), 1);
    assert_eq!(factory.attempts(), 2);
}

#[test]
fn test_factory_failure_wakes_waiters() {
    let factory = MockFactory::new().with_connect_delay(Duration::from_millis(200));
    let (pool, factory) = mock_pool_with(config(1), factory);
    let pool = Arc::new(pool);
    factory.fail_next(1);

    // The first acquirer reserves the only slot, then fails.
    let failing = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire().map(|s| s.id()))
    };
    thread::sleep(Duration::from_millis(50));

    // The second waits on the reservation and then gets its own session.
    let started = Instant::now();
    let session = pool.acquire().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(failing.join().unwrap(), Err(PoolError::SessionFactory(_))));
    assert_eq!(session.get().unwrap().serial(), 1);
}

#[test]
fn test_slow_factory_does_not_block_release() {
    let factory = MockFactory::new().with_connect_delay(Duration::from_millis(400));
    let (pool, _factory) = mock_pool_with(config(2), factory);
    let pool = Arc::new(pool);
    let held = pool.acquire().unwrap();

    let creator = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire().map(|s| s.id()))
    };
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    drop(held);
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "release waited on the factory"
    );
    assert_eq!(pool.num_idle_connections(), 1);

    assert!(creator.join().unwrap().is_ok());
}

#[test]
fn test_concurrent_creation_respects_cap() {
    let factory = MockFactory::new().with_connect_delay(Duration::from_millis(100));
    let (pool, factory) = mock_pool_with(config(2).acquire_timeout(Duration::from_secs(3)), factory);
    let pool = Arc::new(pool);

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let session = pool.acquire().unwrap();
                thread::sleep(Duration::from_millis(20));
                drop(session);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(factory.created(), 2);
    assert_eq!(pool.num_connections(), 2);
}

#[test]
fn test_raising_cap_wakes_waiter() {
    let (pool, factory) = mock_pool(config(1));
    let pool = Arc::new(pool);
    let _held = pool.acquire().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire().map(|s| s.get().map(|s| s.serial()).ok()))
    };
    thread::sleep(Duration::from_millis(100));

    pool.set_max_connections(2).unwrap();
    let serial = waiter.join().unwrap().unwrap();
    assert_eq!(serial, Some(2));
    assert_eq!(factory.created(), 2);
}

#[test]
fn test_lowering_cap_keeps_existing_sessions() {
    let (pool, _factory) = mock_pool(config(3));
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let c = pool.acquire().unwrap();

    pool.set_max_connections(1).unwrap();
    assert_eq!(pool.num_connections(), 3);

    drop(a);
    drop(b);
    drop(c);
    assert_eq!(pool.num_idle_connections(), 3);

    // Idle sessions are still reused even though the pool is over its cap.
    let again = pool.try_acquire().unwrap();
    assert!(again.is_some());
}

#[test]
fn test_try_acquire_never_waits() {
    let (pool, _factory) = mock_pool(config(1));
    let held = pool.try_acquire().unwrap().unwrap();

    let started = Instant::now();
    assert!(pool.try_acquire().unwrap().is_none());
    assert!(started.elapsed() < Duration::from_millis(50));

    drop(held);
    assert!(pool.try_acquire().unwrap().is_some());
}

#[test]
fn test_dead_release_wakes_waiter() {
    let (pool, factory) = mock_pool(config(1));
    let pool = Arc::new(pool);
    let held = pool.acquire().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire().map(|s| s.get().map(|s| s.serial()).ok()))
    };
    thread::sleep(Duration::from_millis(100));

    factory.session(1).unwrap().kill();
    drop(held);

    assert_eq!(waiter.join().unwrap().unwrap(), Some(2));
}

#[test]
fn test_stat_snapshot() {
    let (pool, _factory) = mock_pool(config(4));
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    drop(a);

    let stats = pool.stat();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.heartbeats, 0);
    assert_eq!(stats.max, 4);
    assert!((stats.utilization() - 25.0).abs() < f64::EPSILON);
    assert!(!stats.is_at_capacity());

    let json = serde_json::to_value(stats).unwrap();
    assert_eq!(json["total"], 2);
    assert_eq!(json["idle"], 1);

    drop(b);
}

#[test]
fn test_metrics_track_lifecycle() {
    let (pool, factory) = mock_pool(config(1).acquire_timeout(Duration::from_millis(20)));
    let session = pool.acquire().unwrap();
    assert!(pool.acquire().is_err());
    factory.session(1).unwrap().kill();
    drop(session);
    drop(pool.acquire().unwrap());

    let metrics = pool.metrics();
    assert_eq!(metrics.connections_created, 2);
    assert_eq!(metrics.connections_closed, 1);
    assert_eq!(metrics.checkouts_successful, 2);
    assert_eq!(metrics.checkouts_failed, 1);
    assert_eq!(metrics.evictions, 1);
    assert!((metrics.checkout_success_rate() - 2.0 / 3.0).abs() < 1e-9);

    let json = serde_json::to_value(&metrics).unwrap();
    assert_eq!(json["connections_created"], 2);
}

#[test]
fn test_independent_pools() {
    let (first, first_factory) = mock_pool(config(1));
    let (second, second_factory) = mock_pool(config(1));

    let a = first.acquire().unwrap();
    let b = second.acquire().unwrap();
    assert_eq!(first.num_active_connections(), 1);
    assert_eq!(second.num_active_connections(), 1);
    assert_eq!(first_factory.created(), 1);
    assert_eq!(second_factory.created(), 1);

    drop(a);
    assert_eq!(first.num_idle_connections(), 1);
    assert_eq!(second.num_idle_connections(), 0);
    drop(b);
}
