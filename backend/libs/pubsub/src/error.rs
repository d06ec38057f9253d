//! Error types for queue pullers

use thiserror::Error;

/// Errors that end a puller's `run` loop
#[derive(Debug, Error)]
pub enum PullerError {
    /// Redis connection or command failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Consumer group could not be created for a stream partition
    #[error("Failed to create consumer group '{group}' on '{stream}': {reason}")]
    ConsumerGroup {
        stream: String,
        group: String,
        reason: String,
    },

    /// Reads kept failing past the configured threshold
    #[error("Subscription lost after {consecutive_errors} consecutive read errors: {last_error}")]
    SubscriptionLost {
        consecutive_errors: u32,
        last_error: String,
    },
}
