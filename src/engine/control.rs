//! Command plane: the worker's command channel and the pool it steers.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use super::pool::Pool;
use super::{Shared, lock};
use crate::broker::control::Delivery;
use crate::error::{Error, Result};
use crate::model::{Command, Verb, WorkerConfig, WorkerMetrics, WorkerState};
use crate::telemetry::metrics;

/// Runs on the thread that called [`Worker::run`](super::Worker::run) and
/// owns the pool table.
pub(crate) struct ControlPlane {
    shared: Arc<Shared>,
    pool: Pool,
}

impl ControlPlane {
    pub(crate) fn new(shared: Arc<Shared>, pool: Pool) -> Self {
        Self { shared, pool }
    }

    /// Start the boot configuration. Threads started here resume their
    /// leftover job states.
    pub(crate) fn boot(&mut self, config: WorkerConfig) -> Result<()> {
        let plan = self.pool.apply(config, true)?;
        info!(worker = %self.shared.worker, threads = plan.start.len(), "job threads started");
        Ok(())
    }

    /// Stop and join every job thread.
    pub(crate) fn stop(&mut self) {
        let pool = std::mem::replace(&mut self.pool, Pool::new(Arc::clone(&self.shared)));
        pool.shutdown();
    }

    pub(crate) fn state(&self) -> WorkerState {
        let now = Utc::now();
        WorkerState {
            worker: self.shared.worker.clone(),
            host: self.shared.host.clone(),
            boot_id: self.shared.boot_id,
            pid: std::process::id(),
            started_at: self.shared.started_at,
            heartbeat_at: now,
            metrics: WorkerMetrics {
                processed: self.shared.processed.load(Ordering::Relaxed),
                failed: self.shared.failed.load(Ordering::Relaxed),
                threads: self.pool.len(),
            },
            threads: self.pool.snapshots(),
        }
    }

    pub(crate) fn publish_state(&self) -> Result<()> {
        self.shared.broker.publish_worker_state(&self.state())
    }

    /// Block on the command channel until shutdown.
    pub(crate) fn run(&mut self) {
        let worker = self.shared.worker.clone();
        info!(%worker, "listening for commands");
        while !self.shared.shutdown.is_set() {
            // Deferred slots are re-checked on every short timeout.
            let wait = if self.pool.has_deferred() {
                self.shared.options.idle_sleep()
            } else {
                self.shared.options.command_wait()
            };
            match self.shared.broker.pop_command(&worker, Some(wait)) {
                Ok(Some(Delivery::Command(command))) => self.dispatch(command),
                Ok(Some(Delivery::Wake)) => debug!(%worker, "command thread woken"),
                Ok(None) => {}
                Err(e) if e.is_store() => self.shared.pause_after("read command", &e),
                // Unreadable message: already popped, go on with the next one.
                Err(e) => error!(%worker, error = %e, "bad command dropped"),
            }
            if self.pool.start_deferred() > 0 {
                info!(%worker, threads = self.pool.len(), "deferred job threads started");
                if let Err(e) = self.publish_state() {
                    warn!(%worker, error = %e, "worker state not published");
                }
            }
        }
    }

    pub(crate) fn dispatch(&mut self, command: Command) {
        let verb = command.verb;
        let result = match verb {
            Verb::Report => self.publish_state(),
            Verb::UpdateConfig => self.update_config(),
            Verb::Kill | Verb::Cancel => match command.pid {
                Some(pid) => self.signal(verb, pid),
                None => Err(Error::Other(format!("{verb} without pid"))),
            },
        };
        let outcome = match &result {
            Ok(()) => {
                info!(worker = %self.shared.worker, %verb, "command handled");
                "ok"
            }
            Err(e) => {
                error!(worker = %self.shared.worker, %verb, error = %e, "command failed");
                "error"
            }
        };
        metrics::commands_processed().add(
            1,
            &[
                KeyValue::new("verb", verb.to_string()),
                KeyValue::new("result", outcome),
            ],
        );
    }

    /// Re-read this worker's configuration and reconcile. A missing or
    /// invalid configuration leaves the pool as it is.
    fn update_config(&mut self) -> Result<()> {
        let Some(desired) = self.shared.broker.worker_config(&self.shared.worker)? else {
            return Err(Error::NotFound(format!(
                "configuration of worker {}",
                self.shared.worker
            )));
        };
        let plan = self.pool.apply(desired, false)?;
        info!(
            worker = %self.shared.worker,
            started = plan.start.len(),
            stopped = plan.stop.len(),
            retuned = plan.retune.len(),
            threads = self.pool.config().total_threads(),
            "configuration applied"
        );
        self.publish_state()
    }

    /// Terminate `pid`, but only if one of this worker's jobs recorded it.
    fn signal(&self, verb: Verb, pid: u32) -> Result<()> {
        let owned = self
            .shared
            .broker
            .job_states(Some(&self.shared.worker))?
            .iter()
            .any(|job| job.envelope.runtime.process.pid == Some(pid));
        if !owned {
            warn!(worker = %self.shared.worker, pid, %verb, "pid not owned by any job, refused");
            return Err(Error::NotFound(format!("job process {pid}")));
        }

        if verb == Verb::Cancel {
            lock(&self.shared.cancelled).insert(pid);
        }
        if let Err(e) = terminate(pid) {
            if verb == Verb::Cancel {
                lock(&self.shared.cancelled).remove(&pid);
            }
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Other(format!("kill -TERM {pid} exited with {status}")))
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<()> {
    Err(Error::Other(format!(
        "cannot signal process {pid} on this platform"
    )))
}
