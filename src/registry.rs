//! Process-local registry of task and batch functions.
//!
//! Targets travel through the store as `"<queue>:<function>"` strings and
//! are resolved against a registry built before the worker starts. Each
//! worker owns its registry, so differently configured workers can share a
//! process.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::engine::TaskContext;
use crate::error::{Error, Result};
use crate::model::{Target, return_code};

/// Signature of a task function: context, positional args, keyword args.
pub type TaskFn =
    Arc<dyn Fn(&TaskContext, &[Value], &Map<String, Value>) -> anyhow::Result<Value> + Send + Sync>;

/// Signature of a batch function, run after every N tasks on a queue.
pub type BatchFn = Arc<dyn Fn(&BatchContext) -> anyhow::Result<()> + Send + Sync>;

/// What a batch function is told about the batch it closes.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub queue: String,
    pub worker: String,
    pub thread: String,
    /// Tasks dequeued since the previous batch call.
    pub items: usize,
}

/// Error a task returns to choose its own return code.
///
/// Any other error fails the task with [`return_code::FAILED`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskFailure {
    pub code: i32,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Return code carried anywhere in `err`'s chain, or the generic one.
    pub fn code_of(err: &anyhow::Error) -> i32 {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<TaskFailure>())
            .map_or(return_code::FAILED, |f| f.code)
    }
}

struct Registered {
    default_queue: String,
    func: TaskFn,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Registered>,
    batches: HashMap<String, BatchFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `function` to a callable and its default queue. Re-registering a
    /// name replaces the previous binding.
    pub fn register<F>(&mut self, function: &str, default_queue: &str, f: F) -> &mut Self
    where
        F: Fn(&TaskContext, &[Value], &Map<String, Value>) -> anyhow::Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.tasks.insert(
            function.to_string(),
            Registered {
                default_queue: default_queue.to_string(),
                func: Arc::new(f),
            },
        );
        self
    }

    pub fn register_batch<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&BatchContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.batches.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn default_queue(&self, function: &str) -> Option<&str> {
        self.tasks.get(function).map(|r| r.default_queue.as_str())
    }

    /// Target for `function`: a `"queue:function"` string is taken as-is,
    /// a bare name is looked up for its default queue.
    pub fn target_for(&self, function: &str) -> Result<Target> {
        if function.contains(':') {
            return function.parse();
        }
        self.default_queue(function)
            .map(|queue| Target::new(queue, function))
            .ok_or_else(|| Error::UnknownTask(function.to_string()))
    }

    /// The callable behind a target. Only the function name matters; the
    /// queue says where the envelope waited, not what runs.
    pub fn resolve(&self, target: &Target) -> Result<&TaskFn> {
        self.tasks
            .get(&target.function)
            .map(|r| &r.func)
            .ok_or_else(|| Error::UnknownTask(target.to_string()))
    }

    pub fn batch(&self, name: &str) -> Result<&BatchFn> {
        self.batches
            .get(name)
            .ok_or_else(|| Error::UnknownTask(format!("batch function {name}")))
    }

    pub fn functions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TaskRegistry {
        let mut r = TaskRegistry::new();
        r.register("send", "mail", |_, _, _| Ok(json!(null)));
        r
    }

    #[test]
    fn target_for_uses_default_queue() {
        let r = registry();
        assert_eq!(r.target_for("send").unwrap(), Target::new("mail", "send"));
        assert_eq!(
            r.target_for("bulk:send").unwrap(),
            Target::new("bulk", "send")
        );
        assert!(matches!(r.target_for("nope"), Err(Error::UnknownTask(_))));
    }

    #[test]
    fn resolve_ignores_queue_part() {
        let r = registry();
        assert!(r.resolve(&Target::new("other", "send")).is_ok());
        assert!(matches!(
            r.resolve(&Target::new("mail", "missing")),
            Err(Error::UnknownTask(t)) if t == "mail:missing"
        ));
    }

    #[test]
    fn failure_code_is_found_in_chain() {
        let plain = anyhow::anyhow!("boom");
        assert_eq!(TaskFailure::code_of(&plain), return_code::FAILED);

        let coded = anyhow::Error::new(TaskFailure::new(42, "quota")).context("sending mail");
        assert_eq!(TaskFailure::code_of(&coded), 42);
    }
}
