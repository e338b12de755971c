//! The table of live job threads and how it follows configuration changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{info, warn};

use super::job::JobThread;
use super::{Shared, lock};
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{SlotConfig, SlotId, ThreadSnapshot, ThreadStatus, WorkerConfig};

/// Difference between the running configuration and a desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub start: Vec<(SlotId, SlotConfig)>,
    pub stop: Vec<SlotId>,
    /// Slots that keep running under new poll settings.
    pub retune: Vec<(SlotId, SlotConfig)>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty() && self.retune.is_empty()
    }
}

/// Which threads to start, stop and retune to go from `current` to `desired`.
pub fn plan(current: &WorkerConfig, desired: &WorkerConfig) -> ReconcilePlan {
    let current: BTreeMap<SlotId, SlotConfig> = current.slots().collect();
    let desired: BTreeMap<SlotId, SlotConfig> = desired.slots().collect();

    let mut out = ReconcilePlan::default();
    for (id, cfg) in &desired {
        match current.get(id) {
            None => out.start.push((id.clone(), *cfg)),
            Some(old) if old != cfg => out.retune.push((id.clone(), *cfg)),
            Some(_) => {}
        }
    }
    out.stop = current
        .keys()
        .filter(|id| !desired.contains_key(*id))
        .cloned()
        .collect();
    out
}

/// Queue names end up inside store keys and thread names.
pub fn validate(config: &WorkerConfig) -> Result<()> {
    for queue in config.0.keys() {
        if queue.is_empty() || queue.contains(':') || queue == keys::WAKE {
            return Err(Error::Config(format!("invalid queue name {queue:?}")));
        }
    }
    Ok(())
}

struct Handle {
    config: Arc<Mutex<SlotConfig>>,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<ThreadSnapshot>>,
    join: JoinHandle<()>,
}

impl Handle {
    fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        lock(&self.status).status = ThreadStatus::Stopping;
    }
}

/// Live job threads keyed by `(queue, slot)`. Owned by the command thread.
pub(crate) struct Pool {
    shared: Arc<Shared>,
    config: WorkerConfig,
    threads: BTreeMap<SlotId, Handle>,
    /// Stopped threads that may still be finishing their last item.
    retiring: Vec<(SlotId, Handle)>,
    /// Configured slots waiting for their retiring namesake to exit.
    deferred: BTreeMap<SlotId, SlotConfig>,
}

impl Pool {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            config: WorkerConfig::default(),
            threads: BTreeMap::new(),
            retiring: Vec::new(),
            deferred: BTreeMap::new(),
        }
    }

    pub(crate) fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn snapshots(&self) -> Vec<ThreadSnapshot> {
        self.threads
            .values()
            .chain(self.retiring.iter().map(|(_, h)| h))
            .map(|h| lock(&h.status).clone())
            .collect()
    }

    /// Slots configured but not yet started.
    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Reconcile the live threads with `desired`. An invalid config is
    /// refused and the running one stays. `recover` is set only at boot.
    ///
    /// Never blocks on a running task: a slot whose previous thread is still
    /// finishing is deferred until [`Pool::start_deferred`] finds it gone.
    pub(crate) fn apply(&mut self, desired: WorkerConfig, recover: bool) -> Result<ReconcilePlan> {
        validate(&desired)?;
        let plan = plan(&self.config, &desired);
        self.reap();

        for id in &plan.stop {
            if self.deferred.remove(id).is_some() {
                continue;
            }
            if let Some(handle) = self.threads.remove(id) {
                handle.signal_stop();
                if let Err(e) = self.shared.broker.wake(&id.queue) {
                    warn!(thread = %id, error = %e, "wake-up not pushed");
                }
                info!(worker = %self.shared.worker, thread = %id, "stopping job thread");
                self.retiring.push((id.clone(), handle));
            }
        }

        for (id, cfg) in &plan.retune {
            if let Some(pending) = self.deferred.get_mut(id) {
                *pending = *cfg;
            } else if let Some(handle) = self.threads.get(id) {
                *lock(&handle.config) = *cfg;
                info!(worker = %self.shared.worker, thread = %id, poll_interval = cfg.poll_interval, "job thread retuned");
            }
        }

        for (id, cfg) in &plan.start {
            // A slot name, and with it the job state key, is reused only once
            // the previous thread is gone.
            if self.is_retiring(id) {
                info!(worker = %self.shared.worker, thread = %id, "job thread start deferred");
                self.deferred.insert(id.clone(), *cfg);
            } else {
                self.start(id, *cfg, recover);
            }
        }

        self.config = desired;
        Ok(plan)
    }

    /// Start deferred slots whose retiring namesake has exited. Returns how
    /// many started.
    pub(crate) fn start_deferred(&mut self) -> usize {
        if self.deferred.is_empty() {
            return 0;
        }
        self.reap();
        let ready: Vec<SlotId> = self
            .deferred
            .keys()
            .filter(|id| !self.is_retiring(id))
            .cloned()
            .collect();
        for id in &ready {
            if let Some(cfg) = self.deferred.remove(id) {
                self.start(id, cfg, false);
            }
        }
        ready.len()
    }

    fn is_retiring(&self, id: &SlotId) -> bool {
        self.retiring.iter().any(|(r, _)| r == id)
    }

    fn start(&mut self, id: &SlotId, cfg: SlotConfig, recover: bool) {
        match self.spawn(id, cfg, recover) {
            Ok(handle) => {
                self.threads.insert(id.clone(), handle);
            }
            Err(e) => warn!(thread = %id, error = %e, "job thread not started"),
        }
    }

    fn spawn(&self, id: &SlotId, cfg: SlotConfig, recover: bool) -> Result<Handle> {
        let config = Arc::new(Mutex::new(cfg));
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(ThreadSnapshot::idle(id)));
        let job = JobThread {
            shared: Arc::clone(&self.shared),
            slot: id.clone(),
            config: Arc::clone(&config),
            stop: Arc::clone(&stop),
            status: Arc::clone(&status),
            recover,
        };
        let join = std::thread::Builder::new()
            .name(id.thread_name())
            .spawn(move || job.run())?;
        Ok(Handle {
            config,
            stop,
            status,
            join,
        })
    }

    /// Join retiring threads that have already exited.
    fn reap(&mut self) {
        let (done, still): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retiring)
            .into_iter()
            .partition(|(_, h)| h.join.is_finished());
        self.retiring = still;
        for (id, handle) in done {
            if handle.join.join().is_err() {
                warn!(thread = %id, "retired job thread panicked");
            }
        }
    }

    /// Stop every thread, wake the parked ones and wait for all of them.
    pub(crate) fn shutdown(mut self) {
        self.deferred.clear();
        let threads = std::mem::take(&mut self.threads);
        for (id, handle) in threads {
            handle.signal_stop();
            self.retiring.push((id, handle));
        }
        for (id, _) in &self.retiring {
            if let Err(e) = self.shared.broker.wake(&id.queue) {
                warn!(thread = %id, error = %e, "wake-up not pushed");
            }
        }
        for (id, handle) in self.retiring.drain(..) {
            if handle.join.join().is_err() {
                warn!(thread = %id, "job thread panicked");
            }
        }
        info!(worker = %self.shared.worker, "job threads stopped");
    }
}
