//! Producer-side API: turn a function call into an enqueue.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{error, info};

use crate::broker::buffer::Buffered;
use crate::broker::{Broker, Enqueued};
use crate::error::Result;
use crate::model::{
    ContinuationKind, Continuations, DedupKey, Envelope, Target, TaskCall, TaskStatus,
};
use crate::registry::TaskRegistry;

/// A pending call, built up before submission.
#[derive(Debug, Clone)]
pub struct Invocation {
    function: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    queue: Option<String>,
    priority: bool,
    via_buffer: bool,
    continuations: Continuations,
}

impl Invocation {
    /// `function` is a registered name or a `"queue:function"` string.
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            queue: None,
            priority: false,
            via_buffer: false,
            continuations: Continuations::default(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn kwargs(mut self, values: Map<String, Value>) -> Self {
        self.kwargs.extend(values);
        self
    }

    /// Override the function's default queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Push to the head of the queue instead of the tail.
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    /// Go through the intake buffer instead of straight to the work queue.
    pub fn via_buffer(mut self) -> Self {
        self.via_buffer = true;
        self
    }

    pub fn on_success(mut self, call: TaskCall) -> Self {
        self.continuations.set(ContinuationKind::Success, call);
        self
    }

    pub fn on_failure(mut self, call: TaskCall) -> Self {
        self.continuations.set(ContinuationKind::Failure, call);
        self
    }

    pub fn on_progress(mut self, call: TaskCall) -> Self {
        self.continuations.set(ContinuationKind::Progress, call);
        self
    }
}

/// Where a submitted invocation went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    Enqueued(Enqueued),
    Buffered(Buffered),
}

impl Submitted {
    pub fn key(&self) -> &DedupKey {
        match self {
            Submitted::Enqueued(e) => &e.key,
            Submitted::Buffered(b) => &b.key,
        }
    }
}

/// An external unit of work (e.g. a database transaction) that can run
/// hooks once it commits.
pub trait UnitOfWork {
    fn on_commit(&self, hook: Box<dyn FnOnce() + Send>);
}

/// Minimal [`UnitOfWork`]: hooks run on [`commit`](Self::commit) and are
/// dropped on [`rollback`](Self::rollback).
#[derive(Default)]
pub struct CommitHooks {
    hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(self) {
        let hooks = self.hooks.into_inner().unwrap_or_else(|e| e.into_inner());
        for hook in hooks {
            hook();
        }
    }

    pub fn rollback(self) {
        drop(self);
    }
}

impl UnitOfWork for CommitHooks {
    fn on_commit(&self, hook: Box<dyn FnOnce() + Send>) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }
}

#[derive(Clone)]
pub struct TaskClient {
    broker: Broker,
    registry: Arc<TaskRegistry>,
}

impl TaskClient {
    pub fn new(broker: Broker, registry: Arc<TaskRegistry>) -> Self {
        Self { broker, registry }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Describe a continuation call, resolving its queue through the registry.
    pub fn prepare_callback(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<TaskCall> {
        let target = self.registry.target_for(function)?;
        Ok(TaskCall {
            target,
            args,
            kwargs,
        })
    }

    /// Build the envelope an invocation would enqueue.
    pub fn envelope(&self, invocation: &Invocation) -> Result<Envelope> {
        // Explicit queue first, then a "queue:function" string, then the
        // registered default.
        let target = match &invocation.queue {
            Some(queue) => {
                let function = invocation
                    .function
                    .rsplit_once(':')
                    .map_or(invocation.function.as_str(), |(_, f)| f);
                Target::new(queue.clone(), function)
            }
            None => self.registry.target_for(&invocation.function)?,
        };
        let call = TaskCall {
            target,
            args: invocation.args.clone(),
            kwargs: invocation.kwargs.clone(),
        };
        Ok(Envelope::new(call, invocation.continuations.clone()))
    }

    pub fn invoke(&self, invocation: Invocation) -> Result<Submitted> {
        let envelope = self.envelope(&invocation)?;
        if invocation.via_buffer {
            let buffered = self.broker.push_buffer(&envelope, invocation.priority)?;
            return Ok(Submitted::Buffered(buffered));
        }
        let enqueued = self.broker.enqueue(&envelope, invocation.priority)?;
        Ok(Submitted::Enqueued(enqueued))
    }

    /// Enqueue only once `unit` commits. The envelope is built now, so a bad
    /// target fails here rather than inside the hook.
    pub fn invoke_on_commit(&self, invocation: Invocation, unit: &dyn UnitOfWork) -> Result<DedupKey> {
        let envelope = self.envelope(&invocation)?;
        let key = envelope.dedup_key()?;
        let broker = self.broker.clone();
        let hook_key = key.clone();
        unit.on_commit(Box::new(move || {
            let result = if invocation.via_buffer {
                broker.push_buffer(&envelope, invocation.priority).map(|_| ())
            } else {
                broker.enqueue(&envelope, invocation.priority).map(|_| ())
            };
            match result {
                Ok(()) => info!(key = %hook_key, "enqueued on commit"),
                Err(e) => error!(key = %hook_key, error = %e, "enqueue on commit failed"),
            }
        }));
        Ok(key)
    }

    /// Running, queued or absent. With `promote`, a queued call jumps to
    /// the head of its queue.
    pub fn status(&self, invocation: &Invocation, promote: bool) -> Result<TaskStatus> {
        let envelope = self.envelope(invocation)?;
        self.broker
            .peek_status(&envelope.call, &envelope.continuations, promote)
    }
}
