//! Worker engine: job threads, pool reconciliation, the command plane,
//! the buffer controller and the cron scheduler.
//!
//! Everything here runs on plain OS threads. The only state shared between
//! them is [`Shared`]; the store carries the rest.

pub mod buffer;
pub mod context;
pub mod control;
pub mod cron;
pub mod job;
pub mod pool;
pub mod worker;

pub use context::TaskContext;
pub use cron::CronScheduler;
pub use pool::{ReconcilePlan, plan};
pub use worker::{ShutdownHandle, Worker};

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::WorkerOptions;
use crate::error::Result;
use crate::registry::TaskRegistry;

/// Lock ignoring poison. A panicking task never holds one of the engine's
/// locks, so the data behind a poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Process-wide stop flag that sleeping threads can wait on.
#[derive(Default)]
pub(crate) struct Shutdown {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub(crate) fn trigger(&self) {
        *lock(&self.stopped) = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *lock(&self.stopped)
    }

    /// Sleep for `dur` or until shutdown. Returns true if shutting down.
    pub(crate) fn sleep(&self, dur: Duration) -> bool {
        let guard = lock(&self.stopped);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, dur, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// State every engine thread of one worker process sees.
pub(crate) struct Shared {
    pub(crate) worker: String,
    pub(crate) host: String,
    pub(crate) boot_id: Uuid,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) broker: Broker,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) options: WorkerOptions,
    pub(crate) processed: AtomicU64,
    pub(crate) failed: AtomicU64,
    /// Pids targeted by a `cancel` command and not yet collected by their
    /// job thread.
    pub(crate) cancelled: Mutex<HashSet<u32>>,
    pub(crate) shutdown: Arc<Shutdown>,
}

impl Shared {
    /// Run `op` until it succeeds. Store errors are retried after
    /// `retry_delay`; anything else, or a shutdown, gives up with `None`.
    pub(crate) fn retry<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Option<T> {
        loop {
            match op() {
                Ok(value) => return Some(value),
                Err(e) if e.is_store() => {
                    error!(worker = %self.worker, error = %e, "{what} failed, retrying");
                    if self.shutdown.sleep(self.options.retry_delay()) {
                        return None;
                    }
                }
                Err(e) => {
                    error!(worker = %self.worker, error = %e, "{what} failed");
                    return None;
                }
            }
        }
    }

    /// Log a failed loop step and back off before the next one.
    pub(crate) fn pause_after(&self, what: &str, err: &crate::error::Error) {
        error!(worker = %self.worker, error = %err, "{what} failed");
        self.shutdown.sleep(self.options.retry_delay());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sleep_returns_early_on_trigger() {
        let shutdown = Arc::new(Shutdown::default());
        let s = Arc::clone(&shutdown);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            s.trigger();
        });
        let start = Instant::now();
        assert!(shutdown.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(shutdown.is_set());
        t.join().unwrap();
    }

    #[test]
    fn sleep_times_out_without_trigger() {
        let shutdown = Shutdown::default();
        assert!(!shutdown.sleep(Duration::from_millis(10)));
    }
}
