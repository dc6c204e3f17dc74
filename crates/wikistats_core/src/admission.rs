use serde::Serialize;

use crate::config::Settings;
use crate::model::UpdateLogRecord;

/// Number of update logs kept per course; admission and queueing look only at these.
pub const UPDATE_LOG_RETENTION: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateQueue {
    Short,
    Medium,
    Long,
    VeryLong,
}

impl UpdateQueue {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::VeryLong => "very_long",
        }
    }
}

/// Picks the queue a course's next update belongs in.
pub trait QueuePriority {
    fn queue_for(&self, longest_update_secs: Option<i64>) -> UpdateQueue;
}

/// Buckets by the longest recent run: under a minute, ten minutes, an hour, or more.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationQueuePriority;

impl QueuePriority for DurationQueuePriority {
    fn queue_for(&self, longest_update_secs: Option<i64>) -> UpdateQueue {
        match longest_update_secs {
            None => UpdateQueue::Short,
            Some(secs) if secs < 60 => UpdateQueue::Short,
            Some(secs) if secs < 600 => UpdateQueue::Medium,
            Some(secs) if secs < 3_600 => UpdateQueue::Long,
            Some(_) => UpdateQueue::VeryLong,
        }
    }
}

pub fn longest_update_secs(logs: &[UpdateLogRecord]) -> Option<i64> {
    logs.iter().map(UpdateLogRecord::duration_secs).max()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub threshold_secs: i64,
    /// Privileged deployments always refresh derived data.
    pub bypass: bool,
}

impl AdmissionPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            threshold_secs: settings.admission_threshold_secs,
            bypass: settings.privileged,
        }
    }

    /// Whether the derived-data refresh runs for a course with these recent logs.
    pub fn admits_derived_refresh(&self, logs: &[UpdateLogRecord]) -> bool {
        if self.bypass {
            return true;
        }
        longest_update_secs(logs).is_none_or(|longest| longest < self.threshold_secs)
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}
