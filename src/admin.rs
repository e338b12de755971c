//! Operator actions. Everything goes through the store and the workers'
//! command channels; no worker is ever called directly.

use tracing::info;

use crate::broker::{Broker, Enqueued};
use crate::error::Result;
use crate::model::{
    Command, CronEntry, DedupKey, Envelope, JobState, QueueSettings, WorkerConfig, WorkerState,
    WorklogRecord,
};

#[derive(Clone)]
pub struct Admin {
    broker: Broker,
}

impl Admin {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Grow or shrink `worker`'s thread count on `queue`, then tell it to
    /// reload. Returns the new count.
    pub fn adjust_thread_count(&self, worker: &str, queue: &str, delta: i64) -> Result<usize> {
        let mut config = self.broker.worker_config(worker)?.unwrap_or_default();
        let count = config.adjust(queue, delta);
        self.broker.set_worker_config(worker, &config)?;
        self.broker.push_command(worker, &Command::update_config())?;
        info!(worker, queue, delta, count, "thread count adjusted");
        Ok(count)
    }

    /// Replace `worker`'s whole configuration and tell it to reload.
    pub fn set_worker_config(&self, worker: &str, config: &WorkerConfig) -> Result<()> {
        self.broker.set_worker_config(worker, config)?;
        self.broker.push_command(worker, &Command::update_config())?;
        Ok(())
    }

    /// Ask `worker` to republish its state and reload its configuration.
    /// Commands already pending are not queued twice.
    pub fn resync(&self, worker: &str) -> Result<()> {
        self.broker.push_command(worker, &Command::report())?;
        self.broker.push_command(worker, &Command::update_config())?;
        Ok(())
    }

    /// Returns false when the same kill is already pending.
    pub fn kill(&self, worker: &str, pid: u32) -> Result<bool> {
        self.broker.push_command(worker, &Command::kill(pid))
    }

    pub fn cancel(&self, worker: &str, pid: u32) -> Result<bool> {
        self.broker.push_command(worker, &Command::cancel(pid))
    }

    pub fn workers(&self) -> Result<Vec<WorkerState>> {
        let mut states = self.broker.worker_states()?;
        states.sort_by(|a, b| a.worker.cmp(&b.worker));
        Ok(states)
    }

    pub fn jobs(&self, worker: Option<&str>) -> Result<Vec<JobState>> {
        self.broker.job_states(worker)
    }

    pub fn worklog(&self, limit: usize) -> Result<Vec<WorklogRecord>> {
        self.broker.worklog(limit)
    }

    pub fn set_queue_settings(&self, queue: &str, settings: &QueueSettings) -> Result<()> {
        self.broker.set_queue_settings(queue, settings)
    }

    pub fn queue_settings(&self, queue: &str) -> Result<QueueSettings> {
        self.broker.queue_settings(queue)
    }

    pub fn errors(&self, queue: &str) -> Result<Vec<(DedupKey, Envelope)>> {
        self.broker.list_errors(queue)
    }

    pub fn replay_error(&self, queue: &str, key: &DedupKey) -> Result<Enqueued> {
        self.broker.replay_error(queue, key)
    }

    pub fn replay_all_errors(&self, queue: &str) -> Result<usize> {
        self.broker.replay_all_errors(queue)
    }

    pub fn delete_error(&self, queue: &str, key: &DedupKey) -> Result<()> {
        self.broker.delete_error(queue, key)
    }

    pub fn add_cron(&self, entry: &CronEntry) -> Result<bool> {
        self.broker.add_cron(entry)
    }

    pub fn remove_cron(&self, entry: &CronEntry) -> Result<bool> {
        self.broker.remove_cron(entry)
    }

    pub fn cron_entries(&self) -> Result<Vec<CronEntry>> {
        self.broker.cron_entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Verb;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn admin() -> Admin {
        Admin::new(Broker::new(Arc::new(MemoryStore::new())))
    }

    #[test]
    fn adjust_rewrites_config_and_queues_one_update() {
        let admin = admin();
        assert_eq!(admin.adjust_thread_count("w1", "mail", 2).unwrap(), 2);
        assert_eq!(admin.adjust_thread_count("w1", "mail", -1).unwrap(), 1);

        let config = admin.broker().worker_config("w1").unwrap().unwrap();
        assert_eq!(config.thread_count("mail"), 1);
        let pending = admin.broker().pending_commands("w1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].verb, Verb::UpdateConfig);
    }

    #[test]
    fn shrinking_to_zero_drops_the_queue() {
        let admin = admin();
        admin.adjust_thread_count("w1", "mail", 1).unwrap();
        admin.adjust_thread_count("w1", "mail", -3).unwrap();
        let config = admin.broker().worker_config("w1").unwrap().unwrap();
        assert!(!config.0.contains_key("mail"));
    }

    #[test]
    fn resync_does_not_stack_commands() {
        let admin = admin();
        admin.resync("w1").unwrap();
        admin.resync("w1").unwrap();
        let verbs: Vec<Verb> = admin
            .broker()
            .pending_commands("w1")
            .unwrap()
            .into_iter()
            .map(|c| c.verb)
            .collect();
        assert_eq!(verbs, vec![Verb::Report, Verb::UpdateConfig]);
    }

    #[test]
    fn kill_collapses_on_same_pid_only() {
        let admin = admin();
        assert!(admin.kill("w1", 10).unwrap());
        assert!(!admin.kill("w1", 10).unwrap());
        assert!(admin.kill("w1", 11).unwrap());
        assert!(admin.cancel("w1", 10).unwrap());
    }
}
