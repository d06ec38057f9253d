//! Queue boundary for event consumers
//!
//! Provides the pieces a consumer needs between a message queue and its
//! processing loop:
//! - [`Message`]: payload plus attributes, with consuming `ack()` / `nack()`
//!   so every delivered message gets exactly one outcome
//! - [`Puller`]: a raw subscription that pushes messages into a channel
//! - [`RateLimitedPuller`]: caps the sustained delivery rate and exposes a
//!   [`MessageReceiver`] shared by competing workers
//! - [`RedisStreamPuller`]: Redis Streams consumer-group implementation with
//!   stale-message reclaim
//!
//! # Example
//!
//! ```rust,no_run
//! use pubsub::{RateLimitedPuller, RedisStreamConfig, RedisStreamPuller};
//! use std::num::NonZeroU32;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), pubsub::PullerError> {
//! let client = redis::Client::open("redis://localhost:6379")?;
//! let config = RedisStreamConfig::new("events", "event-persister-dwh");
//! let raw = RedisStreamPuller::connect(client, config).await?;
//!
//! let puller = Arc::new(RateLimitedPuller::new(
//!     Arc::new(raw),
//!     NonZeroU32::new(1000).unwrap(),
//! ));
//! let receiver = puller.message_receiver();
//!
//! let cancel = CancellationToken::new();
//! tokio::spawn({
//!     let puller = Arc::clone(&puller);
//!     let cancel = cancel.clone();
//!     async move { puller.run(cancel).await }
//! });
//!
//! while let Some(message) = receiver.recv().await {
//!     message.ack().await;
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod message;
mod puller;
mod redis_stream;

pub use error::PullerError;
pub use message::{message_channel, Acknowledger, Message, MessageReceiver};
pub use puller::{Puller, RateLimitedPuller};
pub use redis_stream::{RedisStreamConfig, RedisStreamPuller};
