//! Task envelopes on top of a [`Store`]: idempotent enqueue, dequeue,
//! error records, the intake buffer, published state and control data.
//!
//! `Broker` is a cheap handle; clone it into every thread that needs one.

pub mod buffer;
pub mod control;
pub mod failed;
pub mod state;
pub mod task;

use std::sync::Arc;

use crate::codec::Json;
use crate::model::{
    Command, CronEntry, Envelope, JobState, QueueSettings, WorkerConfig, WorkerState,
    WorklogRecord,
};
use crate::store::Store;

pub use task::Enqueued;

/// Codec of `hash:task:*`, `hash:error:*`, `queue:buffer:*`.
pub type EnvelopeCodec = Json<Envelope>;
pub type JobStateCodec = Json<JobState>;
pub type WorkerStateCodec = Json<WorkerState>;
pub type WorklogCodec = Json<WorklogRecord>;
pub type CommandCodec = Json<Command>;
pub type WorkerConfigCodec = Json<WorkerConfig>;
pub type QueueSettingsCodec = Json<QueueSettings>;
pub type CronCodec = Json<CronEntry>;

/// Default bound of `queue:worklog`.
pub const DEFAULT_WORKLOG_LEN: usize = 1000;

#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn Store>,
    worklog_len: usize,
}

impl Broker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            worklog_len: DEFAULT_WORKLOG_LEN,
        }
    }

    pub fn with_worklog_len(mut self, len: usize) -> Self {
        self.worklog_len = len;
        self
    }

    /// The underlying store, for callers that need raw access.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
