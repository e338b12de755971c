//! Task envelopes, targets, continuations and dedup keys.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Return codes stamped into `Runtime::return_code`.
pub mod return_code {
    pub const OK: i32 = 0;
    /// Default for a task that failed without choosing its own code.
    pub const FAILED: i32 = 1;
    pub const UNKNOWN_TASK: i32 = 2;
    pub const CANCELLED: i32 = 3;
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Queue-qualified function reference. On the wire: `"<queue>:<function>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Target {
    pub queue: String,
    pub function: String,
}

impl Target {
    pub fn new(queue: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.queue, self.function)
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((queue, function)) if !queue.is_empty() && !function.is_empty() => {
                Ok(Self::new(queue, function))
            }
            _ => Err(Error::Other(format!(
                "bad target {s:?}: expected \"<queue>:<function>\""
            ))),
        }
    }
}

impl From<Target> for String {
    fn from(t: Target) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for Target {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Calls and continuations
// ---------------------------------------------------------------------------

/// A function call: target plus positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCall {
    pub target: Target,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskCall {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}

/// Which outcome a continuation is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationKind {
    Success,
    Failure,
    Progress,
}

impl fmt::Display for ContinuationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContinuationKind::Success => "success",
            ContinuationKind::Failure => "failure",
            ContinuationKind::Progress => "progress",
        };
        f.write_str(s)
    }
}

/// Calls to enqueue when the owning task succeeds, fails or reports progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Continuations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<TaskCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<TaskCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_progress: Option<TaskCall>,
}

impl Continuations {
    pub fn get(&self, kind: ContinuationKind) -> Option<&TaskCall> {
        match kind {
            ContinuationKind::Success => self.on_success.as_ref(),
            ContinuationKind::Failure => self.on_failure.as_ref(),
            ContinuationKind::Progress => self.on_progress.as_ref(),
        }
    }

    pub fn set(&mut self, kind: ContinuationKind, call: TaskCall) {
        let slot = match kind {
            ContinuationKind::Success => &mut self.on_success,
            ContinuationKind::Failure => &mut self.on_failure,
            ContinuationKind::Progress => &mut self.on_progress,
        };
        *slot = Some(call);
    }

    pub fn is_empty(&self) -> bool {
        self.on_success.is_none() && self.on_failure.is_none() && self.on_progress.is_none()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// OS process a task spawned, if it reported one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub comment: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Mutable execution metadata. Never part of the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub created_at: DateTime<Utc>,
    pub queue: String,
    pub worker: Option<String>,
    pub thread: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub reason: Option<String>,
    #[serde(default)]
    pub process: ProcessInfo,
}

impl Runtime {
    fn fresh(queue: &str) -> Self {
        Self {
            created_at: Utc::now(),
            queue: queue.to_string(),
            worker: None,
            thread: None,
            started_at: None,
            ended_at: None,
            return_code: None,
            reason: None,
            process: ProcessInfo::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Content hash of an envelope's call and continuations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(pub String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialized description of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub call: TaskCall,
    #[serde(default, skip_serializing_if = "Continuations::is_empty")]
    pub continuations: Continuations,
    pub runtime: Runtime,
}

#[derive(Serialize)]
struct HashedContent<'a> {
    call: &'a TaskCall,
    continuations: &'a Continuations,
}

impl Envelope {
    pub fn new(call: TaskCall, continuations: Continuations) -> Self {
        let runtime = Runtime::fresh(&call.target.queue);
        Self {
            call,
            continuations,
            runtime,
        }
    }

    /// Queue this envelope belongs to.
    pub fn queue(&self) -> &str {
        &self.call.target.queue
    }

    pub fn target(&self) -> &Target {
        &self.call.target
    }

    /// Hash of everything but the runtime block. `serde_json::Map` is
    /// ordered, so equal content always serializes to equal bytes.
    pub fn dedup_key(&self) -> Result<DedupKey> {
        let bytes = serde_json::to_vec(&HashedContent {
            call: &self.call,
            continuations: &self.continuations,
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(DedupKey(hex::encode(hasher.finalize())))
    }

    /// Stamp the RUNNING transition.
    pub fn mark_started(&mut self, worker: &str, thread: &str) {
        self.runtime.worker = Some(worker.to_string());
        self.runtime.thread = Some(thread.to_string());
        self.runtime.started_at = Some(Utc::now());
        self.runtime.ended_at = None;
        self.runtime.return_code = None;
        self.runtime.reason = None;
    }

    pub fn mark_finished(&mut self, return_code: i32, reason: Option<String>) {
        self.runtime.ended_at = Some(Utc::now());
        self.runtime.return_code = Some(return_code);
        self.runtime.reason = reason;
    }

    pub fn is_failed(&self) -> bool {
        self.runtime.return_code.is_some_and(|c| c != return_code::OK)
    }

    /// Clear everything a previous execution left behind, keeping the call.
    pub fn reset_runtime(&mut self) {
        let created_at = self.runtime.created_at;
        self.runtime = Runtime::fresh(&self.call.target.queue);
        self.runtime.created_at = created_at;
    }

    /// Wall time of the last execution, if it finished.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.runtime.started_at?;
        let ended = self.runtime.ended_at?;
        Some((ended - started).num_milliseconds().max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Status + audit
// ---------------------------------------------------------------------------

/// Where a given call currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Some worker thread is executing it right now.
    Running { worker: String, thread: String },
    /// Waiting in its work queue.
    Queued,
    Absent,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Running { worker, thread } => write!(f, "running on {worker}/{thread}"),
            TaskStatus::Queued => f.write_str("queued"),
            TaskStatus::Absent => f.write_str("absent"),
        }
    }
}

/// One line of the bounded audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorklogRecord {
    pub key: DedupKey,
    pub target: Target,
    pub worker: String,
    pub thread: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub return_code: i32,
}

impl WorklogRecord {
    pub fn from_envelope(key: &DedupKey, envelope: &Envelope) -> Self {
        Self {
            key: key.clone(),
            target: envelope.call.target.clone(),
            worker: envelope.runtime.worker.clone().unwrap_or_default(),
            thread: envelope.runtime.thread.clone().unwrap_or_default(),
            started_at: envelope.runtime.started_at,
            ended_at: envelope.runtime.ended_at,
            return_code: envelope.runtime.return_code.unwrap_or(return_code::OK),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> TaskCall {
        TaskCall::new(Target::new("mail", "send"))
            .arg(json!("bob@example.com"))
            .kwarg("subject", json!("hi"))
    }

    #[test]
    fn target_round_trips_through_wire_string() {
        let t: Target = "mail:send".parse().unwrap();
        assert_eq!(t, Target::new("mail", "send"));
        assert_eq!(serde_json::to_value(&t).unwrap(), json!("mail:send"));
        assert!("nocolon".parse::<Target>().is_err());
        assert!(":send".parse::<Target>().is_err());
    }

    #[test]
    fn dedup_key_ignores_runtime() {
        let a = Envelope::new(call(), Continuations::default());
        let mut b = Envelope::new(call(), Continuations::default());
        b.mark_started("w1", "mail-0");
        b.mark_finished(return_code::FAILED, Some("boom".into()));
        assert_eq!(a.dedup_key().unwrap(), b.dedup_key().unwrap());
    }

    #[test]
    fn dedup_key_covers_args_kwargs_and_continuations() {
        let base = Envelope::new(call(), Continuations::default());
        let other_arg = Envelope::new(call().arg(json!(1)), Continuations::default());
        let other_kwarg = Envelope::new(call().kwarg("cc", json!("x")), Continuations::default());
        let mut conts = Continuations::default();
        conts.set(
            ContinuationKind::Success,
            TaskCall::new(Target::new("mail", "log")),
        );
        let with_cont = Envelope::new(call(), conts);

        let k = base.dedup_key().unwrap();
        assert_ne!(k, other_arg.dedup_key().unwrap());
        assert_ne!(k, other_kwarg.dedup_key().unwrap());
        assert_ne!(k, with_cont.dedup_key().unwrap());
        assert_eq!(k.as_str().len(), 64);
    }

    #[test]
    fn kwarg_insertion_order_does_not_change_key() {
        let a = TaskCall::new(Target::new("q", "f"))
            .kwarg("a", json!(1))
            .kwarg("b", json!(2));
        let b = TaskCall::new(Target::new("q", "f"))
            .kwarg("b", json!(2))
            .kwarg("a", json!(1));
        assert_eq!(
            Envelope::new(a, Continuations::default()).dedup_key().unwrap(),
            Envelope::new(b, Continuations::default()).dedup_key().unwrap()
        );
    }

    #[test]
    fn reset_runtime_keeps_call_and_creation_time() {
        let mut env = Envelope::new(call(), Continuations::default());
        let created = env.runtime.created_at;
        env.mark_started("w1", "mail-0");
        env.mark_finished(7, Some("bad".into()));
        assert!(env.is_failed());
        env.reset_runtime();
        assert_eq!(env.runtime.created_at, created);
        assert!(env.runtime.started_at.is_none());
        assert!(env.runtime.return_code.is_none());
        assert_eq!(env.call, call());
    }

    #[test]
    fn envelope_wire_format_flattens_call() {
        let env = Envelope::new(call(), Continuations::default());
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["target"], json!("mail:send"));
        assert_eq!(v["args"], json!(["bob@example.com"]));
        assert!(v.get("continuations").is_none());
        let back: Envelope = serde_json::from_value(v).unwrap();
        assert_eq!(back, env);
    }
}
