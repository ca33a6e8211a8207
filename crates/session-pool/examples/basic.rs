//! Basic pool usage with an in-memory session.
//!
//! Run with `RUST_LOG=session_pool=debug cargo run --example basic`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use session_pool::{Pool, PoolError, Session};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
#[error("not connected")]
struct NotConnected;

struct MemorySession {
    connected: AtomicBool,
    statements: AtomicU32,
}

impl Session for MemorySession {
    type Error = NotConnected;

    fn open(&self) -> Result<(), NotConnected> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn query(&self, _text: &str) -> Result<(), NotConnected> {
        if !self.is_connected() {
            return Err(NotConnected);
        }
        self.statements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let pool = Arc::new(
        Pool::builder()
            .max_connections(2)
            .acquire_timeout(Duration::from_millis(500))
            .heartbeat_interval(Duration::from_secs(1))
            .session_initializer(|| -> Result<MemorySession, NotConnected> {
                Ok(MemorySession {
                    connected: AtomicBool::new(false),
                    statements: AtomicU32::new(0),
                })
            })
            .build()?,
    );

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || -> Result<(), PoolError> {
                for job in 0..5 {
                    let session = pool.acquire()?;
                    if let Err(e) = session.get()?.query("UPDATE jobs SET done = 1") {
                        eprintln!("worker {worker} job {job}: {e}");
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("worker failed: {e}"),
            Err(_) => eprintln!("worker panicked"),
        }
    }

    thread::sleep(Duration::from_millis(1600));

    let stats = pool.stat();
    println!(
        "total={} active={} idle={} heartbeats={}",
        stats.total, stats.active, stats.idle, stats.heartbeats
    );
    println!("{:#?}", pool.metrics());

    Ok(())
}
