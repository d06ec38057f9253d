//! Event batch persister
//!
//! Pulls analytics events (flag evaluations and goal conversions) from the
//! event stream, links them to live experiment state, and appends them to
//! the warehouse in batches. Each pulled message is settled exactly once:
//! acked when it was persisted or can never be, nacked when redelivery may
//! succeed.
//!
//! ```text
//! Redis Streams → RateLimitedPuller → BatchWorker ×N → EventExtractor
//!                                          ↓
//!                 ack/nack ← WarehouseWriter ← EventConverter → ExperimentResolver
//! ```

pub mod clients;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use error::{PersisterError, Result};
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{HandledCode, NoopMetrics, PersisterMetrics, PrometheusMetrics};
pub use services::{Collaborators, Persister, PersisterOptions};
