//! Work queue operations: enqueue with dedup, dequeue, status lookup.

use std::time::Duration;

use opentelemetry::KeyValue;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Broker, EnvelopeCodec, JobStateCodec};
use crate::codec::Codec;
use crate::error::Result;
use crate::keys;
use crate::model::{ContinuationKind, Continuations, DedupKey, Envelope, TaskCall, TaskStatus};
use crate::store::End;
use crate::telemetry::metrics;

/// Outcome of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub key: DedupKey,
    /// False when an identical envelope was already waiting.
    pub created: bool,
}

impl Broker {
    /// Write the envelope under its dedup key and push the key, but only if
    /// the write created the map entry. A duplicate keeps its original place.
    pub fn enqueue(&self, envelope: &Envelope, to_head: bool) -> Result<Enqueued> {
        let key = envelope.dedup_key()?;
        let queue = envelope.queue();
        let body = EnvelopeCodec::encode(envelope)?;

        let created = self
            .store
            .map_set_new(&keys::task_map(queue), key.as_str(), &body)?;
        if created {
            let end = if to_head { End::Head } else { End::Tail };
            self.store.push(&keys::task_queue(queue), key.as_str(), end)?;
        }

        debug!(queue, %key, created, to_head, "enqueue");
        metrics::tasks_enqueued().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("result", if created { "created" } else { "duplicate" }),
            ],
        );
        Ok(Enqueued { key, created })
    }

    /// Pop a key and take its envelope. `None` when the queue stayed empty
    /// for `wait`, or when the key's envelope is already gone (wake-ups,
    /// keys raced away by another consumer).
    pub fn dequeue(
        &self,
        queue: &str,
        wait: Option<Duration>,
        direction: End,
    ) -> Result<Option<(DedupKey, Envelope)>> {
        let Some(key) = self.store.pop(&keys::task_queue(queue), direction, wait)? else {
            return Ok(None);
        };
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", "pop"),
            ],
        );

        let Some(body) = self.store.map_take(&keys::task_map(queue), &key)? else {
            if key != keys::WAKE {
                warn!(queue, %key, "popped key without envelope, skipping");
            }
            return Ok(None);
        };
        let envelope = EnvelopeCodec::decode(&body)?;
        Ok(Some((DedupKey(key), envelope)))
    }

    /// Enqueue a bare call at the tail, as a fresh envelope.
    pub fn enqueue_call(&self, call: TaskCall) -> Result<Enqueued> {
        self.enqueue(&Envelope::new(call, Continuations::default()), false)
    }

    /// Fire the `kind` continuation of `continuations`, if one is set, with
    /// `injected` merged over its kwargs.
    pub fn fire_continuation(
        &self,
        continuations: &Continuations,
        kind: ContinuationKind,
        injected: Map<String, Value>,
    ) -> Result<Option<Enqueued>> {
        let Some(call) = continuations.get(kind) else {
            return Ok(None);
        };
        let mut call = call.clone();
        call.kwargs.extend(injected);
        let enqueued = self.enqueue_call(call)?;
        debug!(%kind, key = %enqueued.key, "continuation fired");
        Ok(Some(enqueued))
    }

    /// Push a key without touching the map. Used for wake-ups and buffer
    /// promotion, which have already dealt with dedup.
    pub fn push_key(&self, queue: &str, key: &str, end: End) -> Result<()> {
        self.store.push(&keys::task_queue(queue), key, end)
    }

    /// Unblock one thread parked in a blocking dequeue on `queue`.
    pub fn wake(&self, queue: &str) -> Result<()> {
        self.push_key(queue, keys::WAKE, End::Head)
    }

    /// Take back one unconsumed wake-up marker from `queue`.
    pub fn clear_wake(&self, queue: &str) -> Result<bool> {
        self.store.remove_first(&keys::task_queue(queue), keys::WAKE)
    }

    pub fn queue_len(&self, queue: &str) -> Result<usize> {
        self.store.len(&keys::task_queue(queue))
    }

    /// Envelopes waiting in `queue`, head first.
    pub fn list_queued(&self, queue: &str) -> Result<Vec<(DedupKey, Envelope)>> {
        let map = keys::task_map(queue);
        let mut out = Vec::new();
        for key in self.store.range(&keys::task_queue(queue))? {
            if let Some(body) = self.store.map_get(&map, &key)? {
                out.push((DedupKey(key), EnvelopeCodec::decode(&body)?));
            }
        }
        Ok(out)
    }

    /// Where is this call? In-flight job states are checked first, then the
    /// work map, which also holds buffered calls. With `promote`, a waiting
    /// call is moved to the head of the work queue.
    pub fn peek_status(
        &self,
        call: &TaskCall,
        continuations: &Continuations,
        promote: bool,
    ) -> Result<TaskStatus> {
        let envelope = Envelope::new(call.clone(), continuations.clone());
        let key = envelope.dedup_key()?;
        let queue = envelope.queue();

        for state_key in self.store.keys_with_prefix(&keys::job_state_prefix(None))? {
            let Some(raw) = self.store.get(&state_key)? else {
                continue;
            };
            let job = match JobStateCodec::decode(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(key = %state_key, error = %e, "unreadable job state");
                    continue;
                }
            };
            if job.envelope.dedup_key()? == key {
                return Ok(TaskStatus::Running {
                    worker: job.worker,
                    thread: job.thread,
                });
            }
        }

        if !self.store.map_exists(&keys::task_map(queue), key.as_str())? {
            return Ok(TaskStatus::Absent);
        }
        if promote {
            let list = keys::task_queue(queue);
            // A buffered call skips admission and goes straight to the head.
            if self.store.remove(&list, key.as_str())? > 0 || self.unbuffer(queue, &key)? {
                self.store.push(&list, key.as_str(), End::Head)?;
                debug!(queue, %key, "promoted to head");
            }
        }
        Ok(TaskStatus::Queued)
    }
}
