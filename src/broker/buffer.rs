//! Intake buffer: unbounded `queue:buffer:<name>` of dedup keys, drained
//! into the work queue by the buffer controller. The envelope itself sits in
//! the work map from intake on, so a buffered call already counts as queued.

use opentelemetry::KeyValue;
use tracing::debug;

use super::{Broker, EnvelopeCodec};
use crate::codec::Codec;
use crate::error::Result;
use crate::keys;
use crate::model::{DedupKey, Envelope};
use crate::store::End;
use crate::telemetry::metrics;

/// Outcome of pushing onto the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffered {
    pub key: DedupKey,
    /// False when the same call was already buffered or queued.
    pub accepted: bool,
}

impl Broker {
    /// Buffer an envelope. The dedup key is claimed in the work map here;
    /// a call already buffered or queued is not buffered again.
    pub fn push_buffer(&self, envelope: &Envelope, to_head: bool) -> Result<Buffered> {
        let key = envelope.dedup_key()?;
        let queue = envelope.queue();
        let accepted = self.store.map_set_new(
            &keys::task_map(queue),
            key.as_str(),
            &EnvelopeCodec::encode(envelope)?,
        )?;
        if !accepted {
            debug!(queue, %key, "already queued, not buffered");
            return Ok(Buffered { key, accepted });
        }

        let end = if to_head { End::Head } else { End::Tail };
        self.store.push(&keys::buffer_queue(queue), key.as_str(), end)?;
        metrics::tasks_enqueued().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("result", "buffered"),
            ],
        );
        Ok(Buffered { key, accepted })
    }

    pub fn buffer_len(&self, queue: &str) -> Result<usize> {
        self.store.len(&keys::buffer_queue(queue))
    }

    /// Move one key from the buffer onto the tail of the work queue. The
    /// map entry was written at intake, so nothing is deduped again.
    /// Returns false when the buffer was empty.
    pub fn promote_from_buffer(&self, queue: &str) -> Result<bool> {
        let Some(key) = self.store.pop(&keys::buffer_queue(queue), End::Head, None)? else {
            return Ok(false);
        };
        self.store.push(&keys::task_queue(queue), &key, End::Tail)?;

        metrics::buffer_promoted().add(1, &[KeyValue::new("queue", queue.to_string())]);
        Ok(true)
    }

    /// Pull a buffered key out of the buffer, ahead of admission.
    pub(crate) fn unbuffer(&self, queue: &str, key: &DedupKey) -> Result<bool> {
        Ok(self.store.remove(&keys::buffer_queue(queue), key.as_str())? > 0)
    }
}
