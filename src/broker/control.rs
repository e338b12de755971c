//! Control data: worker/queue configuration, command channels, cron set.

use std::time::Duration;

use tracing::{debug, warn};

use super::{Broker, CommandCodec, CronCodec, QueueSettingsCodec, WorkerConfigCodec};
use crate::codec::Codec;
use crate::error::Result;
use crate::keys;
use crate::model::{Command, CronEntry, QueueSettings, WorkerConfig};
use crate::store::End;

/// What a pop on a command channel produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Command(Command),
    /// Shutdown wake-up; carries no command.
    Wake,
}

impl Broker {
    // -- configuration --

    pub fn worker_config(&self, worker: &str) -> Result<Option<WorkerConfig>> {
        self.store
            .get(&keys::worker_config(worker))?
            .map(|raw| WorkerConfigCodec::decode(&raw))
            .transpose()
    }

    pub fn set_worker_config(&self, worker: &str, config: &WorkerConfig) -> Result<()> {
        self.store
            .set(&keys::worker_config(worker), &WorkerConfigCodec::encode(config)?)
    }

    /// Settings of `queue`; defaults when none were ever written.
    pub fn queue_settings(&self, queue: &str) -> Result<QueueSettings> {
        Ok(self
            .store
            .get(&keys::queue_settings(queue))?
            .map(|raw| QueueSettingsCodec::decode(&raw))
            .transpose()?
            .unwrap_or_default())
    }

    pub fn set_queue_settings(&self, queue: &str, settings: &QueueSettings) -> Result<()> {
        self.store.set(
            &keys::queue_settings(queue),
            &QueueSettingsCodec::encode(settings)?,
        )
    }

    /// Every queue that has settings, by name.
    pub fn all_queue_settings(&self) -> Result<Vec<(String, QueueSettings)>> {
        let mut out = Vec::new();
        for key in self.store.keys_with_prefix(keys::QUEUE_SETTINGS_PREFIX)? {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            let name = key[keys::QUEUE_SETTINGS_PREFIX.len()..].to_string();
            match QueueSettingsCodec::decode(&raw) {
                Ok(settings) => out.push((name, settings)),
                Err(e) => warn!(queue = %name, error = %e, "unreadable queue settings"),
            }
        }
        Ok(out)
    }

    // -- commands --

    /// Queue a command for `worker`. Returns false, without pushing, when an
    /// equivalent command is still pending.
    pub fn push_command(&self, worker: &str, command: &Command) -> Result<bool> {
        if self
            .pending_commands(worker)?
            .iter()
            .any(|pending| command.duplicates(pending))
        {
            debug!(worker, verb = %command.verb, "command already pending");
            return Ok(false);
        }
        self.store.push(
            &keys::command_queue(worker),
            &CommandCodec::encode(command)?,
            End::Tail,
        )?;
        Ok(true)
    }

    pub fn pending_commands(&self, worker: &str) -> Result<Vec<Command>> {
        let mut out = Vec::new();
        for raw in self.store.range(&keys::command_queue(worker))? {
            if raw == keys::WAKE {
                continue;
            }
            match CommandCodec::decode(&raw) {
                Ok(cmd) => out.push(cmd),
                Err(e) => warn!(worker, error = %e, "unreadable pending command"),
            }
        }
        Ok(out)
    }

    /// Block up to `wait` for the next delivery on `worker`'s channel.
    pub fn pop_command(&self, worker: &str, wait: Option<Duration>) -> Result<Option<Delivery>> {
        let Some(raw) = self
            .store
            .pop(&keys::command_queue(worker), End::Head, wait)?
        else {
            return Ok(None);
        };
        if raw == keys::WAKE {
            return Ok(Some(Delivery::Wake));
        }
        Ok(Some(Delivery::Command(CommandCodec::decode(&raw)?)))
    }

    /// Unblock `worker`'s command thread.
    pub fn wake_commands(&self, worker: &str) -> Result<()> {
        self.store
            .push(&keys::command_queue(worker), keys::WAKE, End::Head)
    }

    // -- cron --

    pub fn add_cron(&self, entry: &CronEntry) -> Result<bool> {
        self.store.set_add(keys::CRON, &CronCodec::encode(entry)?)
    }

    pub fn remove_cron(&self, entry: &CronEntry) -> Result<bool> {
        self.store.set_remove(keys::CRON, &CronCodec::encode(entry)?)
    }

    pub fn cron_entries(&self) -> Result<Vec<CronEntry>> {
        let mut out = Vec::new();
        for raw in self.store.set_members(keys::CRON)? {
            match CronCodec::decode(&raw) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(error = %e, "unreadable cron entry"),
            }
        }
        Ok(out)
    }
}
