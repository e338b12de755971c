//! Control-plane messages delivered through `queue:command:<worker>`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    /// Republish worker state.
    Report,
    /// Re-read worker configuration and reconcile the pool.
    UpdateConfig,
    /// Terminate the process recorded in a job state.
    Kill,
    /// Like `Kill`, but the task is not reported as failed.
    Cancel,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Report => "report",
            Verb::UpdateConfig => "update-config",
            Verb::Kill => "kill",
            Verb::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub verb: Verb,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Command {
    fn new(verb: Verb, pid: Option<u32>) -> Self {
        Self {
            verb,
            timestamp: Utc::now(),
            pid,
        }
    }

    pub fn report() -> Self {
        Self::new(Verb::Report, None)
    }

    pub fn update_config() -> Self {
        Self::new(Verb::UpdateConfig, None)
    }

    pub fn kill(pid: u32) -> Self {
        Self::new(Verb::Kill, Some(pid))
    }

    pub fn cancel(pid: u32) -> Self {
        Self::new(Verb::Cancel, Some(pid))
    }

    /// Would delivering `self` repeat an already pending `other`?
    /// Process-targeted verbs only collapse on the same pid.
    pub fn duplicates(&self, other: &Command) -> bool {
        if self.verb != other.verb {
            return false;
        }
        match self.verb {
            Verb::Kill | Verb::Cancel => self.pid == other.pid,
            Verb::Report | Verb::UpdateConfig => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_serialize_kebab_case() {
        let json = serde_json::to_value(Command::update_config()).unwrap();
        assert_eq!(json["verb"], "update-config");
        assert!(json.get("pid").is_none());
    }

    #[test]
    fn duplicates_match_verb_and_pid() {
        assert!(Command::report().duplicates(&Command::report()));
        assert!(!Command::report().duplicates(&Command::update_config()));
        assert!(Command::kill(7).duplicates(&Command::kill(7)));
        assert!(!Command::kill(7).duplicates(&Command::kill(8)));
        assert!(!Command::kill(7).duplicates(&Command::cancel(7)));
    }
}
