//! One job thread: poll a queue, run what comes out, record the outcome.
//!
//! Per item the thread goes IDLE → RUNNING → SUCCESS | FAILED → IDLE. The
//! job state written on entry to RUNNING is what survives a crash; it is
//! deleted only after the outcome has been recorded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use super::context::TaskContext;
use super::{Shared, lock};
use crate::model::{
    ContinuationKind, DedupKey, Envelope, JobState, SlotConfig, SlotId, TaskCall, ThreadSnapshot,
    ThreadStatus, WorklogRecord, return_code,
};
use crate::registry::{BatchContext, TaskFailure};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// How one execution ended.
#[derive(Debug)]
enum Outcome {
    Success(Value),
    Failure {
        code: i32,
        /// One-line description, handed to the failure continuation.
        message: String,
        /// Tail of the full error report, stored on the envelope.
        reason: String,
    },
    Cancelled,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Failure { .. } => "failure",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Items run since the last batch call.
struct OpenBatch {
    function: String,
    items: usize,
}

pub(crate) struct JobThread {
    pub(crate) shared: Arc<Shared>,
    pub(crate) slot: SlotId,
    /// Shared with the pool so retunes apply on the next poll.
    pub(crate) config: Arc<Mutex<SlotConfig>>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) status: Arc<Mutex<ThreadSnapshot>>,
    /// Re-run this thread's job state from a previous process first.
    pub(crate) recover: bool,
}

impl JobThread {
    pub(crate) fn run(self) {
        let thread = self.slot.thread_name();
        info!(worker = %self.shared.worker, %thread, "job thread started");
        if self.recover {
            self.recover_leftover();
        }

        let mut batch: Option<OpenBatch> = None;
        // Whether the last loop ran a task, i.e. the stop came while busy.
        let mut ran_last = false;
        while !self.stopping() {
            ran_last = false;
            let slot = *lock(&self.config);
            let settings = match self.shared.broker.queue_settings(&self.slot.queue) {
                Ok(settings) => settings,
                Err(e) => {
                    self.shared.pause_after("read queue settings", &e);
                    continue;
                }
            };

            match self
                .shared
                .broker
                .dequeue(&self.slot.queue, slot.wait(), slot.direction)
            {
                Ok(Some((key, envelope))) => {
                    self.execute(key, envelope);
                    ran_last = true;
                    if let Some((size, function)) = settings.batch() {
                        let open = batch.get_or_insert_with(|| OpenBatch {
                            function: function.to_string(),
                            items: 0,
                        });
                        open.items += 1;
                        if open.items >= size {
                            self.close_batch(batch.take());
                        }
                    }
                }
                Ok(None) => {
                    self.close_batch(batch.take());
                    if slot.wait().is_none() {
                        self.shared.shutdown.sleep(self.shared.options.idle_sleep());
                    }
                }
                Err(e) => self.shared.pause_after("dequeue", &e),
            }
        }

        self.close_batch(batch.take());
        // The wake-up pushed for this thread was never popped by it.
        if ran_last {
            match self.shared.broker.clear_wake(&self.slot.queue) {
                Ok(cleared) => debug!(%thread, cleared, "leftover wake-up"),
                Err(e) => warn!(%thread, error = %e, "wake-up not cleared"),
            }
        }
        info!(worker = %self.shared.worker, %thread, "job thread stopped");
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.shared.shutdown.is_set()
    }

    fn set_status(&self, status: ThreadStatus, target: Option<String>) {
        let mut snapshot = lock(&self.status);
        snapshot.status = status;
        snapshot.target = target;
        snapshot.since = Utc::now();
    }

    fn job_state(&self, envelope: &Envelope) -> JobState {
        JobState {
            worker: self.shared.worker.clone(),
            thread: self.slot.thread_name(),
            boot_id: self.shared.boot_id,
            envelope: envelope.clone(),
            updated_at: Utc::now(),
        }
    }

    /// A job state written under another boot id means the previous process
    /// died mid-task. Run that envelope again before polling.
    fn recover_leftover(&self) {
        let thread = self.slot.thread_name();
        let shared = &self.shared;
        let Some(job) = shared
            .retry("read job state", || shared.broker.job_state(&shared.worker, &thread))
            .flatten()
        else {
            return;
        };
        if job.boot_id == shared.boot_id {
            return;
        }

        let mut envelope = job.envelope;
        envelope.reset_runtime();
        match envelope.dedup_key() {
            Ok(key) => {
                info!(worker = %shared.worker, %thread, %key, "resuming task left by previous run");
                self.execute(key, envelope);
            }
            Err(e) => error!(worker = %shared.worker, %thread, error = %e, "cannot resume job state"),
        }
    }

    pub(crate) fn execute(&self, key: DedupKey, mut envelope: Envelope) {
        let shared = &self.shared;
        let thread = self.slot.thread_name();
        let target = envelope.call.target.to_string();

        envelope.mark_started(&shared.worker, &thread);
        self.set_status(ThreadStatus::Running, Some(target.clone()));
        let span = start_task_span(&target, &key, &thread);
        record_state_transition(&span, "idle", "running");
        if let Err(e) = shared.broker.write_job_state(&self.job_state(&envelope)) {
            warn!(%key, error = %e, "job state not written");
        }

        let call = envelope.call.clone();
        let ctx = TaskContext::new(Arc::clone(shared), thread.clone(), key.clone(), envelope);
        let outcome = span.in_scope(|| self.invoke(&ctx, &call));
        let mut envelope = ctx.into_envelope();

        let cancelled = envelope
            .runtime
            .process
            .pid
            .is_some_and(|pid| lock(&shared.cancelled).remove(&pid));
        let outcome = match outcome {
            Outcome::Failure { .. } if cancelled => Outcome::Cancelled,
            other => other,
        };

        match &outcome {
            Outcome::Success(value) => {
                envelope.mark_finished(return_code::OK, None);
                let mut injected = Map::new();
                injected.insert("result".to_string(), value.clone());
                self.fire(&envelope, ContinuationKind::Success, injected);
            }
            Outcome::Failure {
                code,
                message,
                reason,
            } => {
                envelope.mark_finished(*code, Some(reason.clone()));
                warn!(%key, %target, code, %message, "task failed");
                shared.retry("file error record", || shared.broker.file_error(&envelope));
                let mut injected = Map::new();
                injected.insert("code".to_string(), json!(code));
                injected.insert("message".to_string(), json!(message));
                self.fire(&envelope, ContinuationKind::Failure, injected);
                shared.failed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Cancelled => {
                envelope.mark_finished(return_code::CANCELLED, Some("cancelled".to_string()));
                info!(%key, %target, "task cancelled");
            }
        }
        shared.processed.fetch_add(1, Ordering::Relaxed);
        record_state_transition(&span, "running", outcome.label());

        if let Err(e) = shared
            .broker
            .append_worklog(&WorklogRecord::from_envelope(&key, &envelope))
        {
            warn!(%key, error = %e, "worklog not written");
        }
        shared.retry("delete job state", || {
            shared.broker.delete_job_state(&shared.worker, &thread)
        });

        let queue = KeyValue::new("queue", self.slot.queue.clone());
        metrics::tasks_executed().add(1, &[queue.clone(), KeyValue::new("outcome", outcome.label())]);
        if let Some(ms) = envelope.duration_ms() {
            metrics::task_duration_ms().record(
                ms as f64,
                &[queue, KeyValue::new("function", envelope.call.target.function.clone())],
            );
        }
        self.set_status(ThreadStatus::Idle, None);
    }

    fn invoke(&self, ctx: &TaskContext, call: &TaskCall) -> Outcome {
        let func = match self.shared.registry.resolve(&call.target) {
            Ok(func) => Arc::clone(func),
            Err(e) => {
                return Outcome::Failure {
                    code: return_code::UNKNOWN_TASK,
                    message: e.to_string(),
                    reason: e.to_string(),
                };
            }
        };

        let err = match panic::catch_unwind(AssertUnwindSafe(|| {
            func(ctx, &call.args, &call.kwargs)
        })) {
            Ok(Ok(value)) => return Outcome::Success(value),
            Ok(Err(err)) => err,
            Err(payload) => anyhow::anyhow!("task panicked: {}", panic_message(payload.as_ref())),
        };

        Outcome::Failure {
            code: TaskFailure::code_of(&err),
            message: format!("{err:#}"),
            reason: tail_lines(&format!("{err:?}"), self.shared.options.trace_lines),
        }
    }

    fn fire(&self, envelope: &Envelope, kind: ContinuationKind, injected: Map<String, Value>) {
        let shared = &self.shared;
        shared.retry("fire continuation", || {
            shared
                .broker
                .fire_continuation(&envelope.continuations, kind, injected.clone())
        });
    }

    fn close_batch(&self, batch: Option<OpenBatch>) {
        let Some(batch) = batch.filter(|b| b.items > 0) else {
            return;
        };
        let func = match self.shared.registry.batch(&batch.function) {
            Ok(func) => Arc::clone(func),
            Err(e) => {
                warn!(queue = %self.slot.queue, error = %e, "batch function not registered");
                return;
            }
        };
        let ctx = BatchContext {
            queue: self.slot.queue.clone(),
            worker: self.shared.worker.clone(),
            thread: self.slot.thread_name(),
            items: batch.items,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| func(&ctx))) {
            Ok(Ok(())) => debug!(
                queue = %ctx.queue,
                items = ctx.items,
                function = %batch.function,
                "batch closed"
            ),
            Ok(Err(e)) => error!(
                queue = %ctx.queue,
                function = %batch.function,
                error = ?e,
                "batch function failed"
            ),
            Err(payload) => error!(
                queue = %ctx.queue,
                function = %batch.function,
                panic = %panic_message(payload.as_ref()),
                "batch function panicked"
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Last `n` lines of `text`.
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=30).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 20);
        assert_eq!(tail.lines().count(), 20);
        assert!(tail.starts_with("11\n"));
        assert!(tail.ends_with("30"));
        assert_eq!(tail_lines("only", 20), "only");
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");
        let s: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(s.as_ref()), "bang");
    }
}
