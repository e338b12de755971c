//! Store key scheme.
//!
//! Every piece of engine state lives under a stable key so that workers on
//! different hosts interoperate through the store alone.

use std::fmt;

/// Bounded audit log of finished tasks, newest first.
pub const WORKLOG: &str = "queue:worklog";

/// Set of serialized cron entries.
pub const CRON: &str = "set:cron";

/// Marker pushed onto a queue to unblock a thread parked in a blocking pop.
/// It never has a companion envelope, so consumers treat it as "nothing to do".
pub const WAKE: &str = "__wake__";

/// The kinds of named sequences the engine keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Work queue of dedup keys, paired with `hash:task:<name>`.
    Task,
    /// Failed envelopes, paired with `hash:error:<name>`.
    Error,
    /// Intake buffer of dedup keys awaiting admission.
    Buffer,
    /// Per-worker command channel.
    Command,
}

impl QueueKind {
    fn as_str(self) -> &'static str {
        match self {
            QueueKind::Task => "task",
            QueueKind::Error => "error",
            QueueKind::Buffer => "buffer",
            QueueKind::Command => "command",
        }
    }

    /// Key of the sequence itself: `queue:<kind>:<name>`.
    pub fn queue(self, name: &str) -> String {
        format!("queue:{}:{name}", self.as_str())
    }

    /// Key of the companion key→envelope map, for kinds that have one.
    pub fn map(self, name: &str) -> Option<String> {
        match self {
            QueueKind::Task | QueueKind::Error => Some(self.hash(name)),
            QueueKind::Buffer | QueueKind::Command => None,
        }
    }

    fn hash(self, name: &str) -> String {
        format!("hash:{}:{name}", self.as_str())
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn task_queue(name: &str) -> String {
    QueueKind::Task.queue(name)
}

pub fn task_map(name: &str) -> String {
    QueueKind::Task.hash(name)
}

pub fn error_queue(name: &str) -> String {
    QueueKind::Error.queue(name)
}

pub fn error_map(name: &str) -> String {
    QueueKind::Error.hash(name)
}

pub fn buffer_queue(name: &str) -> String {
    QueueKind::Buffer.queue(name)
}

pub fn command_queue(worker: &str) -> String {
    QueueKind::Command.queue(worker)
}

pub fn worker_state(worker: &str) -> String {
    format!("state:worker:{worker}")
}

pub const WORKER_STATE_PREFIX: &str = "state:worker:";

pub fn job_state(worker: &str, thread: &str) -> String {
    format!("state:job:{worker}:{thread}")
}

/// Prefix of all job states, or of one worker's job states. Worker ids may
/// contain `:` (IPv6 addresses), so a worker prefix can also cover another
/// worker's keys; filter on the decoded state.
pub fn job_state_prefix(worker: Option<&str>) -> String {
    match worker {
        Some(w) => format!("state:job:{w}:"),
        None => "state:job:".to_string(),
    }
}

pub fn worker_config(worker: &str) -> String {
    format!("config:worker:{worker}")
}

pub fn queue_settings(queue: &str) -> String {
    format!("config:queue:{queue}")
}

pub const QUEUE_SETTINGS_PREFIX: &str = "config:queue:";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_stable_names() {
        assert_eq!(task_queue("mail"), "queue:task:mail");
        assert_eq!(error_queue("mail"), "queue:error:mail");
        assert_eq!(buffer_queue("mail"), "queue:buffer:mail");
        assert_eq!(command_queue("10.0.0.7"), "queue:command:10.0.0.7");
        assert_eq!(QueueKind::Task.map("mail").as_deref(), Some("hash:task:mail"));
        assert_eq!(QueueKind::Error.map("mail").as_deref(), Some(error_map("mail").as_str()));
        assert_eq!(task_map("mail"), "hash:task:mail");
        assert_eq!(error_map("mail"), "hash:error:mail");
        assert!(QueueKind::Buffer.map("mail").is_none());
    }

    #[test]
    fn job_state_keys_share_worker_prefix() {
        let key = job_state("w1", "mail-0");
        assert!(key.starts_with(&job_state_prefix(Some("w1"))));
        assert!(key.starts_with(&job_state_prefix(None)));
    }
}
