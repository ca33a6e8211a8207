//! Background heartbeat for idle sessions.
//!
//! One thread per pool wakes every `heartbeat_tick`, picks the idle sessions
//! whose last heartbeat is older than `heartbeat_interval`, and runs the
//! heartbeat query against them with the pool lock released. Sessions that
//! fail the probe are closed and removed.
//!
//! The thread only holds a weak reference to the pool. If the pool lock is
//! contended when a cycle starts, the cycle is skipped and the next one runs
//! after the shorter `heartbeat_busy_tick`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::lifecycle::{HealthCheckResult, PooledRecord, Session, SessionId, SessionState};
use crate::pool::PoolInner;

/// What a heartbeat cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cycle {
    /// Heartbeats are disabled.
    Disabled,
    /// The pool lock was contended; nothing was probed.
    Busy,
    /// Probed `probed` sessions, of which `evicted` failed.
    Completed { probed: usize, evicted: usize },
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    /// Sleep for `tick` or until stopped. Returns whether the loop should exit.
    fn sleep(&self, tick: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cvar.wait_for(&mut stopped, tick);
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cvar.notify_all();
    }
}

/// Owner of the heartbeat thread.
pub(crate) struct HeartbeatHandle {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub(crate) fn spawn<S: Session>(pool: Weak<PoolInner<S>>) -> std::io::Result<Self> {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);

        let thread = std::thread::Builder::new()
            .name("session-pool-heartbeat".into())
            .spawn(move || run(&pool, &thread_signal))?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for the current cycle to finish.
    pub(crate) fn stop(mut self) {
        self.signal.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.signal.stop();
    }
}

fn run<S: Session>(pool: &Weak<PoolInner<S>>, signal: &StopSignal) {
    tracing::debug!("heartbeat thread started");

    let mut tick = match pool.upgrade() {
        Some(inner) => inner.config.read().heartbeat_tick,
        None => return,
    };

    loop {
        if signal.sleep(tick) {
            break;
        }

        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }

        let (interval, query, nominal, busy) = {
            let config = inner.config.read();
            (
                config.heartbeat_interval,
                config.heartbeat_query.clone(),
                config.heartbeat_tick,
                config.heartbeat_busy_tick,
            )
        };

        let cycle = inner.heartbeat_cycle(interval, &query);
        if let Cycle::Completed { probed, evicted } = cycle {
            if evicted > 0 {
                tracing::debug!(probed, evicted, "heartbeat cycle evicted sessions");
            }
        }
        tick = next_tick(cycle, nominal, busy);
    }

    tracing::debug!("heartbeat thread stopped");
}

/// Sleep before the next cycle: short after a contended cycle, nominal otherwise.
fn next_tick(cycle: Cycle, nominal: Duration, busy: Duration) -> Duration {
    match cycle {
        Cycle::Busy => busy,
        Cycle::Disabled | Cycle::Completed { .. } => nominal,
    }
}

impl<S: Session> PoolInner<S> {
    /// Run one heartbeat cycle.
    pub(crate) fn heartbeat_cycle(&self, interval: Duration, query: &str) -> Cycle {
        if interval.is_zero() {
            return Cycle::Disabled;
        }

        let batch: Vec<(SessionId, Arc<S>)> = {
            let Some(mut state) = self.state.try_write() else {
                tracing::trace!("pool busy, deferring heartbeat");
                return Cycle::Busy;
            };
            state
                .idle
                .values_mut()
                .filter(|record| record.heartbeat_due(interval))
                .map(|record| {
                    record.begin_heartbeat();
                    (record.id(), Arc::clone(&record.session))
                })
                .collect()
        };

        if batch.is_empty() {
            return Cycle::Completed {
                probed: 0,
                evicted: 0,
            };
        }

        tracing::debug!(count = batch.len(), "probing idle sessions");

        let results: Vec<(SessionId, HealthCheckResult)> = batch
            .iter()
            .map(|(id, session)| (*id, probe(session.as_ref(), query)))
            .collect();

        let mut failed = 0;
        for (id, result) in &results {
            match result {
                HealthCheckResult::Healthy { latency } => {
                    self.heartbeats.fetch_add(1, Ordering::AcqRel);
                    tracing::trace!(session_id = %id, latency = ?latency, "heartbeat ok");
                }
                HealthCheckResult::Failed { error } => {
                    failed += 1;
                    tracing::warn!(session_id = %id, error = %error, "heartbeat failed, evicting session");
                }
            }
        }

        let evicted: Vec<PooledRecord<S>> = {
            let mut state = self.state.write();
            for (id, result) in &results {
                // Shutdown may have drained the record while the probe ran.
                if let Some(record) = state.idle.get_mut(id) {
                    if record.state() == SessionState::PendingHeartbeat {
                        record.complete_heartbeat(result);
                    }
                }
            }

            let canceled: Vec<SessionId> = state
                .idle
                .iter()
                .filter(|(_, record)| record.state() == SessionState::Canceled)
                .map(|(id, _)| *id)
                .collect();
            canceled
                .iter()
                .filter_map(|id| state.idle.remove(id))
                .collect()
        };

        for record in &evicted {
            record.session.close();
        }

        {
            let mut metrics = self.metrics.lock();
            metrics.heartbeats_performed += results.len() as u64;
            metrics.heartbeats_failed += failed;
            metrics.evictions += evicted.len() as u64;
            metrics.connections_closed += evicted.len() as u64;
        }

        // Probed sessions are available again and evicted ones free their slots.
        self.notify_released();

        Cycle::Completed {
            probed: results.len(),
            evicted: evicted.len(),
        }
    }
}

/// Probe one session, treating a panicking driver as a failed probe.
fn probe<S: Session>(session: &S, query: &str) -> HealthCheckResult {
    catch_unwind(AssertUnwindSafe(|| HealthCheckResult::probe(session, query))).unwrap_or_else(
        |_| HealthCheckResult::Failed {
            error: "heartbeat probe panicked".into(),
        },
    )
}
