//! Worker settings loaded from a TOML file.
//!
//! ```toml
//! buffer = true
//! cron_tick_secs = 55
//!
//! [[queues.default]]
//! poll_interval = 30
//!
//! [[queues.mail]]
//! poll_interval = 5
//! direction = "tail"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::DEFAULT_WORKLOG_LEN;
use crate::error::{Error, Result};
use crate::model::WorkerConfig;

fn yes() -> bool {
    true
}
fn default_buffer_interval_ms() -> u64 {
    1000
}
fn default_cron_tick_secs() -> u64 {
    55
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_idle_sleep_ms() -> u64 {
    1000
}
fn default_command_wait_secs() -> u64 {
    3600
}
fn default_trace_lines() -> usize {
    20
}
fn default_worklog_len() -> usize {
    DEFAULT_WORKLOG_LEN
}

/// Process-level knobs. Everything has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    /// Run the buffer controller thread.
    #[serde(default = "yes")]
    pub buffer: bool,
    /// Run the cron thread.
    #[serde(default = "yes")]
    pub cron: bool,
    #[serde(default = "default_buffer_interval_ms")]
    pub buffer_interval_ms: u64,
    #[serde(default = "default_cron_tick_secs")]
    pub cron_tick_secs: u64,
    /// Pause after a store error before retrying.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Pause after an empty non-blocking dequeue.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// Longest single wait on the command channel.
    #[serde(default = "default_command_wait_secs")]
    pub command_wait_secs: u64,
    /// Lines of the error chain kept in a failed envelope's `reason`.
    #[serde(default = "default_trace_lines")]
    pub trace_lines: usize,
    #[serde(default = "default_worklog_len")]
    pub worklog_len: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            buffer: true,
            cron: true,
            buffer_interval_ms: default_buffer_interval_ms(),
            cron_tick_secs: default_cron_tick_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            command_wait_secs: default_command_wait_secs(),
            trace_lines: default_trace_lines(),
            worklog_len: default_worklog_len(),
        }
    }
}

impl WorkerOptions {
    pub fn buffer_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_interval_ms)
    }

    pub fn cron_tick(&self) -> Duration {
        Duration::from_secs(self.cron_tick_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn command_wait(&self) -> Duration {
        Duration::from_secs(self.command_wait_secs)
    }
}

/// Contents of a worker TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerFile {
    #[serde(flatten)]
    pub options: WorkerOptions,
    /// Seed configuration; ignored when the store already holds one.
    #[serde(default)]
    pub queues: WorkerConfig,
}

impl WorkerFile {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("bad worker file: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::End;

    #[test]
    fn empty_file_is_all_defaults() {
        let file = WorkerFile::parse("").unwrap();
        assert_eq!(file.options, WorkerOptions::default());
        assert_eq!(file.queues.total_threads(), 0);
    }

    #[test]
    fn parses_options_and_queues() {
        let file = WorkerFile::parse(
            r#"
            cron = false
            trace_lines = 5

            [[queues.default]]

            [[queues.mail]]
            poll_interval = -1
            direction = "tail"

            [[queues.mail]]
            "#,
        )
        .unwrap();
        assert!(!file.options.cron);
        assert!(file.options.buffer);
        assert_eq!(file.options.trace_lines, 5);
        assert_eq!(file.queues.thread_count("default"), 1);
        assert_eq!(file.queues.thread_count("mail"), 2);
        assert_eq!(file.queues.0["mail"][0].direction, End::Tail);
        assert_eq!(file.queues.0["mail"][0].wait(), None);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(matches!(
            WorkerFile::parse("queues = 3"),
            Err(Error::Config(_))
        ));
    }
}
