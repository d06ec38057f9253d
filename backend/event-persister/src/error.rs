use thiserror::Error;

pub type Result<T> = std::result::Result<T, PersisterError>;

/// Errors raised while turning queued events into warehouse rows
///
/// Payloads are strings so a single failure can be shared between every
/// caller of a coalesced lookup.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PersisterError {
    #[error("Bad message: {0}")]
    BadMessage(String),

    #[error("Message has no id attribute")]
    MissingId,

    #[error("Event timestamp {0} is outside the accepted window")]
    InvalidEventTimestamp(i64),

    #[error("No experiments found")]
    NoExperiments,

    #[error("Experiment not found")]
    ExperimentNotFound,

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Experiment service error: {0}")]
    ExperimentClient(String),

    #[error("User evaluation not found")]
    EvaluationNotFound,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Flush deadline exceeded")]
    FlushTimeout,

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Puller error: {0}")]
    Puller(String),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PersisterError {
    /// Whether redelivering the message could succeed
    ///
    /// Retriable failures are nacked, everything else is acked and dropped.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PersisterError::ExperimentClient(_)
                | PersisterError::EvaluationNotFound
                | PersisterError::Storage(_)
                | PersisterError::FlushTimeout
        )
    }
}

impl From<serde_json::Error> for PersisterError {
    fn from(err: serde_json::Error) -> Self {
        PersisterError::Json(err.to_string())
    }
}

impl From<redis::RedisError> for PersisterError {
    fn from(err: redis::RedisError) -> Self {
        PersisterError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for PersisterError {
    fn from(err: reqwest::Error) -> Self {
        PersisterError::ExperimentClient(err.to_string())
    }
}

impl From<clickhouse::error::Error> for PersisterError {
    fn from(err: clickhouse::error::Error) -> Self {
        PersisterError::Warehouse(err.to_string())
    }
}

impl From<pubsub::PullerError> for PersisterError {
    fn from(err: pubsub::PullerError) -> Self {
        PersisterError::Puller(err.to_string())
    }
}
