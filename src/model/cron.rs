//! Cron entries kept in `set:cron`.

use chrono::{DateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronEntry {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Destination queue.
    pub queue: String,
    /// Fire only during this hour; every hour if unset.
    #[serde(default)]
    pub hour: Option<u32>,
    /// Fire at this minute; minute 0 if unset.
    #[serde(default)]
    pub minute: Option<u32>,
}

impl CronEntry {
    pub fn new(function: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            queue: queue.into(),
            hour: None,
            minute: None,
        }
    }

    pub fn at(mut self, hour: Option<u32>, minute: Option<u32>) -> Self {
        self.hour = hour;
        self.minute = minute;
        self
    }

    /// An unset minute means minute 0, not "any minute": an hour-only entry
    /// fires once, at the top of its hour.
    pub fn is_due(&self, hour: u32, minute: u32) -> bool {
        let hour_matches = self.hour.is_none_or(|h| h == hour);
        hour_matches && self.minute.unwrap_or(0) == minute
    }

    pub fn is_due_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.is_due(now.hour(), now.minute())
    }
}
