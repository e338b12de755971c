//! # taskq
//!
//! At-least-once task queue on a shared key-value/queue store.
//!
//! Producers enqueue calls through [`TaskClient`]; identical calls collapse
//! onto one content-hashed key. Workers drain named queues with pools of OS
//! threads, file failures for replay, fire continuations, and take
//! reconfiguration and kill commands through the store while running.

pub mod admin;
pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod model;
pub mod registry;
pub mod store;
pub mod telemetry;

pub use admin::Admin;
pub use broker::Broker;
pub use client::{CommitHooks, Invocation, Submitted, TaskClient, UnitOfWork};
pub use engine::{ShutdownHandle, TaskContext, Worker};
pub use error::{Error, Result};
pub use registry::{TaskFailure, TaskRegistry};
