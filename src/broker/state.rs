//! Worker state, job state and the bounded worklog.

use tracing::warn;

use super::{Broker, JobStateCodec, WorkerStateCodec, WorklogCodec};
use crate::codec::Codec;
use crate::error::Result;
use crate::keys;
use crate::model::{JobState, WorkerState, WorklogRecord};
use crate::store::End;

impl Broker {
    pub fn publish_worker_state(&self, state: &WorkerState) -> Result<()> {
        self.store.set(
            &keys::worker_state(&state.worker),
            &WorkerStateCodec::encode(state)?,
        )
    }

    pub fn worker_state(&self, worker: &str) -> Result<Option<WorkerState>> {
        self.store
            .get(&keys::worker_state(worker))?
            .map(|raw| WorkerStateCodec::decode(&raw))
            .transpose()
    }

    /// Every published worker state. Unreadable entries are skipped.
    pub fn worker_states(&self) -> Result<Vec<WorkerState>> {
        let mut out = Vec::new();
        for key in self.store.keys_with_prefix(keys::WORKER_STATE_PREFIX)? {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            match WorkerStateCodec::decode(&raw) {
                Ok(state) => out.push(state),
                Err(e) => warn!(%key, error = %e, "unreadable worker state"),
            }
        }
        Ok(out)
    }

    pub fn write_job_state(&self, job: &JobState) -> Result<()> {
        self.store.set(
            &keys::job_state(&job.worker, &job.thread),
            &JobStateCodec::encode(job)?,
        )
    }

    pub fn job_state(&self, worker: &str, thread: &str) -> Result<Option<JobState>> {
        self.store
            .get(&keys::job_state(worker, thread))?
            .map(|raw| JobStateCodec::decode(&raw))
            .transpose()
    }

    pub fn delete_job_state(&self, worker: &str, thread: &str) -> Result<()> {
        self.store.delete(&keys::job_state(worker, thread))?;
        Ok(())
    }

    /// In-flight jobs of one worker, or of every worker.
    pub fn job_states(&self, worker: Option<&str>) -> Result<Vec<JobState>> {
        let mut out = Vec::new();
        for key in self
            .store
            .keys_with_prefix(&keys::job_state_prefix(worker))?
        {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            match JobStateCodec::decode(&raw) {
                Ok(job) if worker.is_none_or(|w| w == job.worker) => out.push(job),
                Ok(_) => {}
                Err(e) => warn!(%key, error = %e, "unreadable job state"),
            }
        }
        Ok(out)
    }

    /// Prepend to the audit log and cut it back to its bound.
    pub fn append_worklog(&self, record: &WorklogRecord) -> Result<()> {
        self.store
            .push(keys::WORKLOG, &WorklogCodec::encode(record)?, End::Head)?;
        self.store.trim(keys::WORKLOG, self.worklog_len)
    }

    /// Newest first, at most `limit` records.
    pub fn worklog(&self, limit: usize) -> Result<Vec<WorklogRecord>> {
        self.store
            .range(keys::WORKLOG)?
            .iter()
            .take(limit)
            .map(|raw| WorklogCodec::decode(raw))
            .collect()
    }
}
