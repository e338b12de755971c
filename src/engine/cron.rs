//! Cron scheduler: enqueue due entries of `set:cron` once per minute.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::Shared;
use crate::broker::Broker;
use crate::error::Result;
use crate::model::{CronEntry, Target, TaskCall};
use crate::telemetry::metrics;

pub struct CronScheduler {
    broker: Broker,
    /// (year, ordinal day, hour, minute) of the last tick that fired.
    last: Option<(i32, u32, u32, u32)>,
}

impl CronScheduler {
    pub fn new(broker: Broker) -> Self {
        Self { broker, last: None }
    }

    /// Enqueue every entry due at `now`. A minute already handled by an
    /// earlier tick fires nothing. Returns the number of entries fired.
    pub fn tick<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> Result<usize> {
        let minute = (now.year(), now.ordinal(), now.hour(), now.minute());
        if self.last == Some(minute) {
            return Ok(0);
        }

        let mut fired = 0;
        for entry in self.broker.cron_entries()? {
            if !entry.is_due_at(now) {
                continue;
            }
            let enqueued = self.broker.enqueue_call(call_of(&entry))?;
            info!(function = %entry.function, queue = %entry.queue, created = enqueued.created, "cron fired");
            metrics::cron_fired().add(1, &[KeyValue::new("function", entry.function.clone())]);
            fired += 1;
        }
        self.last = Some(minute);
        Ok(fired)
    }
}

fn call_of(entry: &CronEntry) -> TaskCall {
    TaskCall {
        target: Target::new(entry.queue.clone(), entry.function.clone()),
        args: entry.args.clone(),
        kwargs: entry.kwargs.clone(),
    }
}

pub(crate) fn run(shared: Arc<Shared>) {
    info!(worker = %shared.worker, "cron scheduler started");
    let mut scheduler = CronScheduler::new(shared.broker.clone());
    loop {
        if let Err(e) = scheduler.tick(&Local::now()) {
            warn!(worker = %shared.worker, error = %e, "cron tick failed");
        }
        if shared.shutdown.sleep(shared.options.cron_tick()) {
            break;
        }
    }
    info!(worker = %shared.worker, "cron scheduler stopped");
}
