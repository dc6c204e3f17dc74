use chrono::{DateTime, Utc};

/// Errors that make a course's timeslice configuration unusable.
///
/// These are the only failures that abort an update run; callers can recover
/// the variant with `anyhow::Error::downcast_ref::<ConfigError>()`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("timeslice duration must be positive (got {0} seconds)")]
    NonPositiveDuration(i64),
    #[error("course ends ({end}) before it starts ({start})")]
    InvertedDateRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("unknown wiki project: {0}")]
    UnknownProject(String),
    #[error("invalid language {language:?} for project {project}")]
    InvalidLanguage {
        project: String,
        language: Option<String>,
    },
}
