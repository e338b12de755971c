//! Error records: failed envelopes kept per origin queue for replay.

use opentelemetry::KeyValue;
use tracing::info;

use super::{Broker, Enqueued, EnvelopeCodec};
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{DedupKey, Envelope};
use crate::store::End;
use crate::telemetry::metrics;

impl Broker {
    /// File a failed envelope under its origin queue. Filing the same call
    /// twice keeps one record holding the latest failure.
    pub fn file_error(&self, envelope: &Envelope) -> Result<DedupKey> {
        let key = envelope.dedup_key()?;
        let queue = envelope.queue();
        let map = keys::error_map(queue);
        let body = EnvelopeCodec::encode(envelope)?;

        if self.store.map_set_new(&map, key.as_str(), &body)? {
            self.store
                .push(&keys::error_queue(queue), key.as_str(), End::Tail)?;
        } else {
            self.store.map_set(&map, key.as_str(), &body)?;
        }

        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", "file_error"),
            ],
        );
        Ok(key)
    }

    /// Error records of `queue`, oldest first.
    pub fn list_errors(&self, queue: &str) -> Result<Vec<(DedupKey, Envelope)>> {
        let map = keys::error_map(queue);
        let mut out = Vec::new();
        for key in self.store.range(&keys::error_queue(queue))? {
            if let Some(body) = self.store.map_get(&map, &key)? {
                out.push((DedupKey(key), EnvelopeCodec::decode(&body)?));
            }
        }
        Ok(out)
    }

    pub fn error_count(&self, queue: &str) -> Result<usize> {
        self.store.len(&keys::error_queue(queue))
    }

    /// Move one error record back into its work queue. The call is kept
    /// as-is; the runtime block is reset so the next run stamps fresh times.
    pub fn replay_error(&self, queue: &str, key: &DedupKey) -> Result<Enqueued> {
        let mut envelope = self.take_error(queue, key)?;
        envelope.reset_runtime();
        let enqueued = self.enqueue(&envelope, false)?;
        info!(queue, %key, "replayed error record");
        Ok(enqueued)
    }

    /// Replay every error record of `queue`. Returns how many were moved.
    pub fn replay_all_errors(&self, queue: &str) -> Result<usize> {
        let keys: Vec<DedupKey> = self
            .store
            .range(&keys::error_queue(queue))?
            .into_iter()
            .map(DedupKey)
            .collect();
        let mut moved = 0;
        for key in &keys {
            match self.replay_error(queue, key) {
                Ok(_) => moved += 1,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(moved)
    }

    /// Drop an error record for good.
    pub fn delete_error(&self, queue: &str, key: &DedupKey) -> Result<()> {
        self.take_error(queue, key).map(|_| ())
    }

    fn take_error(&self, queue: &str, key: &DedupKey) -> Result<Envelope> {
        self.store.remove(&keys::error_queue(queue), key.as_str())?;
        let body = self
            .store
            .map_take(&keys::error_map(queue), key.as_str())?
            .ok_or_else(|| Error::NotFound(format!("error record {key} in {queue}")))?;
        EnvelopeCodec::decode(&body)
    }
}
