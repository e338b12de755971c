//! What a running task can see and do.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Shared, lock};
use crate::broker::Enqueued;
use crate::error::Result;
use crate::model::{ContinuationKind, DedupKey, Envelope, JobState, Target};

/// Handle passed to every task function.
pub struct TaskContext {
    shared: Arc<Shared>,
    thread: String,
    key: DedupKey,
    envelope: Mutex<Envelope>,
}

impl TaskContext {
    pub(crate) fn new(shared: Arc<Shared>, thread: String, key: DedupKey, envelope: Envelope) -> Self {
        Self {
            shared,
            thread,
            key,
            envelope: Mutex::new(envelope),
        }
    }

    pub fn worker(&self) -> &str {
        &self.shared.worker
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn key(&self) -> &DedupKey {
        &self.key
    }

    pub fn target(&self) -> Target {
        lock(&self.envelope).call.target.clone()
    }

    /// Enqueue the progress continuation, if the caller attached one, with
    /// `value` as its `progress` kwarg.
    pub fn progress(&self, value: impl Into<Value>) -> Result<Option<Enqueued>> {
        let continuations = lock(&self.envelope).continuations.clone();
        let mut injected = Map::new();
        injected.insert("progress".to_string(), value.into());
        self.shared
            .broker
            .fire_continuation(&continuations, ContinuationKind::Progress, injected)
    }

    /// Note an OS process this task spawned, so `kill` and `cancel` can find
    /// it through the job state.
    pub fn record_process(&self, pid: u32, comment: impl Into<String>) -> Result<()> {
        let snapshot = {
            let mut envelope = lock(&self.envelope);
            envelope.runtime.process.pid = Some(pid);
            envelope.runtime.process.comment = Some(comment.into());
            envelope.runtime.process.started_at = Some(Utc::now());
            envelope.clone()
        };
        debug!(thread = %self.thread, pid, "process recorded");
        self.shared.broker.write_job_state(&JobState {
            worker: self.shared.worker.clone(),
            thread: self.thread.clone(),
            boot_id: self.shared.boot_id,
            envelope: snapshot,
            updated_at: Utc::now(),
        })
    }

    /// True once a `cancel` command hit the process this task recorded.
    /// Long-running tasks can poll it to stop early.
    pub fn is_cancelled(&self) -> bool {
        let pid = lock(&self.envelope).runtime.process.pid;
        pid.is_some_and(|pid| lock(&self.shared.cancelled).contains(&pid))
    }

    pub(crate) fn into_envelope(self) -> Envelope {
        self.envelope.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}
