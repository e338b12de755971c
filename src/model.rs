//! Core data model.
//!
//! An envelope is one unit of work: a call to a named function on a named
//! queue, optional continuations to fire on its outcome, and the runtime
//! block a worker stamps while executing it. Everything else here is the
//! bookkeeping workers publish about themselves.

pub mod command;
pub mod cron;
pub mod task;
pub mod worker;

pub use command::{Command, Verb};
pub use cron::CronEntry;
pub use task::*;
pub use worker::*;
