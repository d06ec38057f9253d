//! Redis Streams consumer-group puller
//!
//! Each partition is a stream named `<topic>-<n>` read through one consumer
//! group (the subscription). Acknowledged entries are removed from the
//! group's pending list with `XACK`; a nack leaves the entry pending, and the
//! reclaim loop hands it out again once it has been idle for `idle_time`.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PullerError;
use crate::message::{Acknowledger, Message};
use crate::puller::Puller;

/// Entry field holding the serialized payload
const DATA_FIELD: &str = "data";

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound of pending entries inspected per partition per reclaim pass
const RECLAIM_BATCH: usize = 10;

/// Floor for the reclaim period; a zero period would reclaim before every read
const MIN_RECLAIM_INTERVAL: Duration = Duration::from_secs(1);

/// Redis stream puller configuration
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Base stream name; partitions are `<topic>-<n>`
    pub topic: String,
    /// Consumer group name
    pub subscription: String,
    /// Consumer name within the group (unique per process)
    pub consumer: String,
    /// Number of stream partitions
    pub partition_count: usize,
    /// Max entries per XREADGROUP call
    pub batch_size: usize,
    /// How long one XREADGROUP call blocks waiting for entries
    pub block: Duration,
    /// Pending entries idle longer than this are reclaimed
    pub idle_time: Duration,
    /// How often the reclaim pass runs
    pub reclaim_interval: Duration,
    /// Consecutive read failures tolerated before the subscription is declared lost
    pub max_consecutive_errors: u32,
}

impl RedisStreamConfig {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        let topic = topic.into();
        let subscription = subscription.into();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self {
            consumer: format!("{}-{}-{}", subscription, topic, nanos),
            topic,
            subscription,
            partition_count: 1,
            batch_size: 10,
            block: Duration::from_secs(5),
            idle_time: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            max_consecutive_errors: 10,
        }
    }

    pub fn stream_key(&self, partition: usize) -> String {
        format!("{}-{}", self.topic, partition)
    }

    pub fn stream_keys(&self) -> Vec<String> {
        (0..self.partition_count)
            .map(|p| self.stream_key(p))
            .collect()
    }
}

/// Consecutive read failure tracking with capped exponential backoff
#[derive(Debug, Default)]
struct ReadErrorState {
    consecutive: u32,
}

impl ReadErrorState {
    fn record_success(&mut self) {
        self.consecutive = 0;
    }

    fn record_error(&mut self) -> u32 {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive
    }

    /// 1s, 2s, 4s, ... capped at 30s
    fn backoff(&self) -> Duration {
        if self.consecutive == 0 {
            return MIN_BACKOFF;
        }
        let factor = 2u32.saturating_pow(self.consecutive - 1);
        MIN_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Decides when the next reclaim pass is due
///
/// Checked between reads only, so a reclaim never races a blocking
/// XREADGROUP whose reply would otherwise be dropped with the entries it
/// already moved to this consumer's pending list.
#[derive(Debug)]
struct ReclaimSchedule {
    period: Duration,
    next: Instant,
}

impl ReclaimSchedule {
    /// The first pass is due immediately
    fn new(period: Duration, now: Instant) -> Self {
        Self {
            period: period.max(MIN_RECLAIM_INTERVAL),
            next: now,
        }
    }

    fn due(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next = now + self.period;
        true
    }
}

/// XACKs one stream entry on ack; nack leaves it pending
struct StreamEntryAcknowledger {
    conn: ConnectionManager,
    stream: String,
    group: String,
    entry_id: String,
}

#[async_trait]
impl Acknowledger for StreamEntryAcknowledger {
    async fn ack(&self) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> =
            conn.xack(&self.stream, &self.group, &[&self.entry_id]).await;
        if let Err(e) = result {
            error!(
                error = %e,
                stream = %self.stream,
                subscription = %self.group,
                id = %self.entry_id,
                "Failed to acknowledge message"
            );
        }
    }

    async fn nack(&self) {
        debug!(
            stream = %self.stream,
            subscription = %self.group,
            id = %self.entry_id,
            "Message not acknowledged, left pending for redelivery"
        );
    }
}

/// Redis Streams implementation of [`Puller`]
pub struct RedisStreamPuller {
    client: redis::Client,
    acks: ConnectionManager,
    config: RedisStreamConfig,
}

impl RedisStreamPuller {
    /// Connect the acknowledgement connection. Reads use their own
    /// connection, opened in `pull`, so a blocking XREADGROUP never delays acks.
    pub async fn connect(
        client: redis::Client,
        config: RedisStreamConfig,
    ) -> Result<Self, PullerError> {
        let acks = ConnectionManager::new(client.clone()).await?;
        info!(
            topic = %config.topic,
            subscription = %config.subscription,
            consumer = %config.consumer,
            partitions = config.partition_count,
            "Redis stream puller connected"
        );
        Ok(Self {
            client,
            acks,
            config,
        })
    }

    async fn ensure_consumer_groups(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<(), PullerError> {
        for stream in self.config.stream_keys() {
            let created: redis::RedisResult<()> = conn
                .xgroup_create_mkstream(&stream, &self.config.subscription, "0")
                .await;
            match created {
                Ok(()) => debug!(stream = %stream, "Created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => {
                    return Err(PullerError::ConsumerGroup {
                        stream,
                        group: self.config.subscription.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &[String],
    ) -> redis::RedisResult<Option<StreamReadReply>> {
        let ids = vec![">"; keys.len()];
        let options = StreamReadOptions::default()
            .group(&self.config.subscription, &self.config.consumer)
            .count(self.config.batch_size)
            .block(self.config.block.as_millis() as usize);
        conn.xread_options(keys, &ids, &options).await
    }

    /// Claim entries other consumers (or this one) left pending too long
    async fn reclaim_stale(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> redis::RedisResult<Vec<(String, StreamId)>> {
        let idle_ms = self.config.idle_time.as_millis() as usize;
        let mut reclaimed = Vec::new();

        for stream in self.config.stream_keys() {
            let pending: StreamPendingCountReply = conn
                .xpending_count(&stream, &self.config.subscription, "-", "+", RECLAIM_BATCH)
                .await?;
            let stale: Vec<String> = pending
                .ids
                .into_iter()
                .filter(|p| p.last_delivered_ms >= idle_ms)
                .map(|p| p.id)
                .collect();
            if stale.is_empty() {
                continue;
            }

            let claimed: StreamClaimReply = conn
                .xclaim(
                    &stream,
                    &self.config.subscription,
                    &self.config.consumer,
                    idle_ms,
                    &stale,
                )
                .await?;
            info!(
                stream = %stream,
                requested = stale.len(),
                claimed = claimed.ids.len(),
                "Reclaimed stale messages"
            );
            reclaimed.extend(claimed.ids.into_iter().map(|id| (stream.clone(), id)));
        }

        Ok(reclaimed)
    }

    fn to_message(&self, stream: &str, entry: StreamId) -> Message {
        let mut data = Vec::new();
        let mut attributes = HashMap::with_capacity(entry.map.len() + 1);
        for (field, value) in &entry.map {
            if field == DATA_FIELD {
                data = redis::from_redis_value(value).unwrap_or_default();
            } else if let Ok(v) = redis::from_redis_value::<String>(value) {
                attributes.insert(field.clone(), v);
            }
        }
        attributes.insert("stream".to_string(), stream.to_string());

        let acknowledger = StreamEntryAcknowledger {
            conn: self.acks.clone(),
            stream: stream.to_string(),
            group: self.config.subscription.clone(),
            entry_id: entry.id.clone(),
        };
        Message::new(entry.id, attributes, data, Box::new(acknowledger))
    }

    /// Returns false once the sink is closed or the puller is cancelled
    async fn deliver(
        &self,
        cancel: &CancellationToken,
        sink: &mpsc::Sender<Message>,
        stream: &str,
        entry: StreamId,
    ) -> bool {
        let message = self.to_message(stream, entry);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = sink.send(message) => sent.is_ok(),
        }
    }
}

#[async_trait]
impl Puller for RedisStreamPuller {
    async fn pull(
        &self,
        cancel: CancellationToken,
        sink: mpsc::Sender<Message>,
    ) -> Result<(), PullerError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.ensure_consumer_groups(&mut conn).await?;

        let keys = self.config.stream_keys();
        let mut errors = ReadErrorState::default();
        let mut reclaim = ReclaimSchedule::new(self.config.reclaim_interval, Instant::now());

        loop {
            if reclaim.due(Instant::now()) {
                match self.reclaim_stale(&mut conn).await {
                    Ok(entries) => {
                        for (stream, entry) in entries {
                            if !self.deliver(&cancel, &sink, &stream, entry).await {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to reclaim pending messages"),
                }
            }

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(subscription = %self.subscription_name(), "Context cancelled, stopping pull");
                    return Ok(());
                }
                reply = self.read_new(&mut conn, &keys) => reply,
            };

            match reply {
                Ok(reply) => {
                    errors.record_success();
                    for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
                        for entry in stream_key.ids {
                            if !self.deliver(&cancel, &sink, &stream_key.key, entry).await {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e) => {
                    let consecutive = errors.record_error();
                    if consecutive >= self.config.max_consecutive_errors {
                        error!(
                            consecutive_errors = consecutive,
                            error = %e,
                            "Redis stream read keeps failing, giving up"
                        );
                        return Err(PullerError::SubscriptionLost {
                            consecutive_errors: consecutive,
                            last_error: e.to_string(),
                        });
                    }
                    let backoff = errors.backoff();
                    error!(
                        consecutive_errors = consecutive,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "Failed to read from streams (will retry with backoff)"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    fn subscription_name(&self) -> String {
        format!("{}:{}", self.config.subscription, self.config.topic)
    }
}
