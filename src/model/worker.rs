//! Worker configuration and the state workers publish about themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::Envelope;
use crate::store::End;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_poll_interval() -> i64 {
    30
}

/// How one job thread polls its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Seconds to block in each dequeue. Zero or negative is non-blocking.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: i64,
    #[serde(default)]
    pub direction: End,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            direction: End::Head,
        }
    }
}

impl SlotConfig {
    pub fn wait(&self) -> Option<Duration> {
        (self.poll_interval > 0).then(|| Duration::from_secs(self.poll_interval as u64))
    }
}

/// Identity of one job thread: the queue it drains and its slot index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    pub queue: String,
    pub slot: usize,
}

impl SlotId {
    pub fn new(queue: impl Into<String>, slot: usize) -> Self {
        Self {
            queue: queue.into(),
            slot,
        }
    }

    /// Thread name, also the last segment of the job state key.
    pub fn thread_name(&self) -> String {
        format!("{}-{}", self.queue, self.slot)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.queue, self.slot)
    }
}

/// Queue name → one entry per job thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerConfig(pub BTreeMap<String, Vec<SlotConfig>>);

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder helper: `threads` default slots on `queue`.
    pub fn with_queue(mut self, queue: impl Into<String>, threads: usize) -> Self {
        self.0
            .insert(queue.into(), vec![SlotConfig::default(); threads]);
        self
    }

    pub fn with_slots(mut self, queue: impl Into<String>, slots: Vec<SlotConfig>) -> Self {
        self.0.insert(queue.into(), slots);
        self
    }

    pub fn thread_count(&self, queue: &str) -> usize {
        self.0.get(queue).map_or(0, Vec::len)
    }

    /// Every configured thread, in a stable order.
    pub fn slots(&self) -> impl Iterator<Item = (SlotId, SlotConfig)> + '_ {
        self.0.iter().flat_map(|(queue, slots)| {
            slots
                .iter()
                .enumerate()
                .map(move |(i, cfg)| (SlotId::new(queue.clone(), i), *cfg))
        })
    }

    /// Grow with default slots or shrink from the end. A queue that reaches
    /// zero threads is dropped. Returns the new thread count.
    pub fn adjust(&mut self, queue: &str, delta: i64) -> usize {
        let current = self.thread_count(queue) as i64;
        let target = (current + delta).max(0) as usize;
        if target == 0 {
            self.0.remove(queue);
            return 0;
        }
        let slots = self.0.entry(queue.to_string()).or_default();
        slots.resize(target, SlotConfig::default());
        target
    }

    pub fn total_threads(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

/// Per-queue settings shared by every worker (`config:queue:<name>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Cap used by the buffer controller when admitting buffered work.
    #[serde(default)]
    pub thread_limit: Option<usize>,
    /// Run `batch_function` once every `batch_size` successful tasks.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_function: Option<String>,
}

impl QueueSettings {
    /// Batch size and function, only when both are set and the size is usable.
    pub fn batch(&self) -> Option<(usize, &str)> {
        match (self.batch_size, self.batch_function.as_deref()) {
            (Some(n), Some(f)) if n > 0 => Some((n, f)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Published state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Idle,
    Running,
    Stopping,
}

/// What one job thread is doing right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub thread: String,
    pub queue: String,
    pub status: ThreadStatus,
    pub target: Option<String>,
    pub since: DateTime<Utc>,
}

impl ThreadSnapshot {
    pub fn idle(slot: &SlotId) -> Self {
        Self {
            thread: slot.thread_name(),
            queue: slot.queue.clone(),
            status: ThreadStatus::Idle,
            target: None,
            since: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub processed: u64,
    pub failed: u64,
    pub threads: usize,
}

/// Published at `state:worker:<id>` on boot and on every `report` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker: String,
    pub host: String,
    /// Changes on every process start; tells stale job states apart.
    pub boot_id: Uuid,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub metrics: WorkerMetrics,
    pub threads: Vec<ThreadSnapshot>,
}

/// The envelope a job thread is executing (`state:job:<worker>:<thread>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub worker: String,
    pub thread: String,
    pub boot_id: Uuid,
    pub envelope: Envelope,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_enumerate_every_thread() {
        let cfg = WorkerConfig::new().with_queue("a", 2).with_queue("b", 1);
        let names: Vec<String> = cfg.slots().map(|(id, _)| id.thread_name()).collect();
        assert_eq!(names, vec!["a-0", "a-1", "b-0"]);
        assert_eq!(cfg.total_threads(), 3);
    }

    #[test]
    fn adjust_grows_shrinks_and_drops() {
        let mut cfg = WorkerConfig::new().with_queue("a", 1);
        assert_eq!(cfg.adjust("a", 2), 3);
        assert_eq!(cfg.adjust("a", -1), 2);
        assert_eq!(cfg.adjust("new", 1), 1);
        assert_eq!(cfg.adjust("a", -5), 0);
        assert!(!cfg.0.contains_key("a"));
        assert_eq!(cfg.thread_count("new"), 1);
    }

    #[test]
    fn non_positive_poll_interval_is_non_blocking() {
        let mut slot = SlotConfig::default();
        assert_eq!(slot.wait(), Some(Duration::from_secs(30)));
        slot.poll_interval = -1;
        assert_eq!(slot.wait(), None);
    }

    #[test]
    fn worker_config_wire_format_is_a_plain_map() {
        let cfg: WorkerConfig =
            serde_json::from_str(r#"{"mail":[{"poll_interval":5,"direction":"tail"},{}]}"#)
                .unwrap();
        assert_eq!(cfg.thread_count("mail"), 2);
        assert_eq!(cfg.0["mail"][0].direction, End::Tail);
        assert_eq!(cfg.0["mail"][1], SlotConfig::default());
    }

    #[test]
    fn batch_requires_size_and_function() {
        let mut s = QueueSettings {
            batch_size: Some(10),
            ..Default::default()
        };
        assert!(s.batch().is_none());
        s.batch_function = Some("flush".into());
        assert_eq!(s.batch(), Some((10, "flush")));
        s.batch_size = Some(0);
        assert!(s.batch().is_none());
    }
}
