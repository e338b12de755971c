//! Worker bootstrap and lifecycle.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::control::ControlPlane;
use super::pool::Pool;
use super::{Shared, Shutdown, buffer, cron};
use crate::broker::Broker;
use crate::config::{WorkerOptions, reachable_ip};
use crate::error::{Error, Result};
use crate::model::WorkerConfig;
use crate::registry::TaskRegistry;
use crate::store::Store;

/// Stops a running [`Worker`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    worker: String,
    broker: Broker,
    shutdown: Arc<Shutdown>,
}

impl ShutdownHandle {
    /// Ask the worker to stop. Running tasks finish first; `Worker::run`
    /// returns once every thread has been joined.
    pub fn shutdown(&self) {
        info!(worker = %self.worker, "shutdown requested");
        self.shutdown.trigger();
        if let Err(e) = self.broker.wake_commands(&self.worker) {
            warn!(worker = %self.worker, error = %e, "command thread not woken");
        }
    }
}

pub struct Worker {
    id: String,
    host: String,
    broker: Broker,
    registry: Arc<TaskRegistry>,
    options: WorkerOptions,
    seed: WorkerConfig,
    shutdown: Arc<Shutdown>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn Store>,
        registry: Arc<TaskRegistry>,
        options: WorkerOptions,
    ) -> Self {
        let broker = Broker::new(store).with_worklog_len(options.worklog_len);
        Self {
            id: id.into(),
            host: reachable_ip().to_string(),
            broker,
            registry,
            options,
            seed: WorkerConfig::default(),
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    /// Configuration to use when the store holds none for this worker.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.seed = config;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            worker: self.id.clone(),
            broker: self.broker.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Boot, then serve commands on the calling thread until shut down.
    ///
    /// Boot order: publish worker state, re-enqueue orphaned job states,
    /// start the job threads (each resuming its own leftover job state),
    /// then the buffer and cron threads.
    pub fn run(self) -> Result<()> {
        let shared = Arc::new(Shared {
            worker: self.id,
            host: self.host,
            boot_id: Uuid::new_v4(),
            started_at: Utc::now(),
            broker: self.broker,
            registry: self.registry,
            options: self.options,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: Mutex::new(HashSet::new()),
            shutdown: self.shutdown,
        });
        info!(worker = %shared.worker, host = %shared.host, boot_id = %shared.boot_id, "worker starting");

        let Some(config) = load_config(&shared, self.seed) else {
            if shared.shutdown.is_set() {
                info!(worker = %shared.worker, "shut down during boot");
                return Ok(());
            }
            return Err(Error::Config(format!(
                "no usable configuration for worker {}",
                shared.worker
            )));
        };

        let mut control = ControlPlane::new(Arc::clone(&shared), Pool::new(Arc::clone(&shared)));
        if let Err(e) = control.publish_state() {
            warn!(worker = %shared.worker, error = %e, "worker state not published");
        }
        requeue_orphans(&shared, &config);
        if let Err(e) = control.boot(config) {
            error!(worker = %shared.worker, error = %e, "configuration refused, starting without job threads");
        }
        if let Err(e) = control.publish_state() {
            warn!(worker = %shared.worker, error = %e, "worker state not published");
        }

        let mut aux: Vec<JoinHandle<()>> = Vec::new();
        if shared.options.buffer {
            let s = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("buffer".into())
                .spawn(move || buffer::run(s))?;
            aux.push(handle);
        }
        if shared.options.cron {
            let s = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("cron".into())
                .spawn(move || cron::run(s))?;
            aux.push(handle);
        }

        control.run();

        control.stop();
        for handle in aux {
            if handle.join().is_err() {
                warn!(worker = %shared.worker, "auxiliary thread panicked");
            }
        }
        if let Err(e) = control.publish_state() {
            warn!(worker = %shared.worker, error = %e, "final worker state not published");
        }
        info!(worker = %shared.worker, "worker stopped");
        Ok(())
    }
}

/// A configuration already in the store wins over the seed; the seed is
/// written only when there is none.
fn load_config(shared: &Shared, seed: WorkerConfig) -> Option<WorkerConfig> {
    let stored = shared.retry("read worker configuration", || {
        shared.broker.worker_config(&shared.worker)
    })?;
    if let Some(config) = stored {
        info!(worker = %shared.worker, threads = config.total_threads(), "using stored configuration");
        return Some(config);
    }
    shared.retry("write worker configuration", || {
        shared.broker.set_worker_config(&shared.worker, &seed)
    })?;
    Some(seed)
}

/// Job states of threads this boot will not start are pushed back onto
/// their queues so some thread picks them up again.
fn requeue_orphans(shared: &Shared, config: &WorkerConfig) {
    let configured: HashSet<String> = config.slots().map(|(id, _)| id.thread_name()).collect();
    let Some(jobs) = shared.retry("list job states", || {
        shared.broker.job_states(Some(&shared.worker))
    }) else {
        return;
    };

    for job in jobs {
        if configured.contains(&job.thread) {
            continue;
        }
        let mut envelope = job.envelope;
        envelope.reset_runtime();
        match shared.broker.enqueue(&envelope, true) {
            Ok(enqueued) => {
                info!(worker = %shared.worker, thread = %job.thread, key = %enqueued.key, "orphaned job re-enqueued");
                if let Err(e) = shared.broker.delete_job_state(&shared.worker, &job.thread) {
                    warn!(thread = %job.thread, error = %e, "orphaned job state not deleted");
                }
            }
            Err(e) => error!(worker = %shared.worker, thread = %job.thread, error = %e, "orphaned job not re-enqueued"),
        }
    }
}
