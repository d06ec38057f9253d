use futures::future::join_all;
use pubsub::{Message, MessageReceiver};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::converter::EventConverter;
use super::extractor::{EventExtractor, ExtractedBatch};
use crate::error::{PersisterError, Result};
use crate::metrics::{HandledCode, PersisterMetrics};
use crate::models::{EvaluationEventRow, EventKind, GoalEventRow, WarehouseRow};
use crate::storage::WarehouseWriter;

/// Attribute carrying the event id a batch is keyed by
pub const ID_ATTRIBUTE: &str = "id";

/// Batching thresholds of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub flush_size: usize,
    pub flush_interval: Duration,
    pub flush_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Collecting,
    Flushing,
}

/// Collaborators shared by every worker of a persister
#[derive(Clone)]
pub struct WorkerContext {
    pub extractor: Arc<EventExtractor>,
    pub converter: Arc<EventConverter>,
    pub evaluation_writer: Arc<dyn WarehouseWriter<EvaluationEventRow>>,
    pub goal_writer: Arc<dyn WarehouseWriter<GoalEventRow>>,
    pub metrics: Arc<dyn PersisterMetrics>,
}

/// Accumulates messages from the shared receiver and flushes them in batches
///
/// A batch is flushed once it holds `flush_size` distinct ids or when the
/// flush interval fires with anything pending. On cancellation the pending
/// batch is abandoned unsettled; the queue redelivers it.
pub struct BatchWorker {
    id: usize,
    receiver: MessageReceiver,
    context: WorkerContext,
    options: BatchOptions,
}

impl BatchWorker {
    pub fn new(
        id: usize,
        receiver: MessageReceiver,
        context: WorkerContext,
        options: BatchOptions,
    ) -> Self {
        Self {
            id,
            receiver,
            context,
            options,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(worker = self.id, "Batch worker started");

        let mut batch: HashMap<String, Message> = HashMap::with_capacity(self.options.flush_size);
        let timer = tokio::time::sleep(self.options.flush_interval);
        tokio::pin!(timer);

        loop {
            let state = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        worker = self.id,
                        pending = batch.len(),
                        "Batch worker stopping, pending messages left for redelivery"
                    );
                    return Ok(());
                }
                _ = &mut timer => {
                    if batch.is_empty() {
                        timer.as_mut().reset(Instant::now() + self.options.flush_interval);
                        WorkerState::Collecting
                    } else {
                        WorkerState::Flushing
                    }
                }
                message = self.receiver.recv() => match message {
                    Some(message) => self.collect(&mut batch, message).await,
                    None => {
                        info!(worker = self.id, "Message channel closed");
                        return Ok(());
                    }
                },
            };

            if state == WorkerState::Flushing {
                self.flush(std::mem::take(&mut batch)).await;
                timer
                    .as_mut()
                    .reset(Instant::now() + self.options.flush_interval);
            }
        }
    }

    /// Add a message to the batch, superseding any earlier message with its id
    async fn collect(&self, batch: &mut HashMap<String, Message>, message: Message) -> WorkerState {
        self.context.metrics.message_received();

        let Some(id) = message.attribute(ID_ATTRIBUTE).map(str::to_string) else {
            warn!(message_id = %message.id, error = %PersisterError::MissingId, "Dropping message");
            message.ack().await;
            self.context.metrics.message_handled(HandledCode::MissingId);
            return WorkerState::Collecting;
        };

        if let Some(previous) = batch.insert(id.clone(), message) {
            warn!(id = %id, "Duplicate event id in batch, acking the earlier message");
            previous.ack().await;
            self.context.metrics.message_handled(HandledCode::DuplicateId);
        }

        if batch.len() >= self.options.flush_size {
            WorkerState::Flushing
        } else {
            WorkerState::Collecting
        }
    }

    /// Convert, write and settle one batch
    ///
    /// Runs to completion even during shutdown; the deadline bounds it instead.
    pub async fn flush(&self, messages: HashMap<String, Message>) {
        let deadline = Instant::now() + self.options.flush_timeout;
        let received = messages.len();

        let ExtractedBatch { events, messages } = self.context.extractor.extract(messages).await;
        if events.is_empty() {
            error!(worker = self.id, received, "All messages in the batch were bad");
            return;
        }

        let converter = &self.context.converter;
        let conversions = events.iter().flat_map(move |(environment, events)| {
            events.iter().map(move |(id, event)| async move {
                let result = timeout_at(deadline, converter.convert(id, environment, event))
                    .await
                    .unwrap_or(Err(PersisterError::FlushTimeout));
                (id.as_str(), environment.as_str(), event.kind(), result)
            })
        });

        let mut fails: HashMap<String, bool> = HashMap::new();
        let mut evaluation_rows = Vec::new();
        let mut goal_rows = Vec::new();

        for (id, environment, kind, result) in join_all(conversions).await {
            match result {
                Ok(WarehouseRow::Evaluation(row)) => evaluation_rows.push(row),
                Ok(WarehouseRow::Goal(row)) => goal_rows.push(row),
                // Nothing to link the event to; settles as handled
                Err(e @ PersisterError::NoExperiments) => {
                    log_conversion_failure(id, environment, kind, &e);
                }
                Err(e) => {
                    log_conversion_failure(id, environment, kind, &e);
                    fails.insert(id.to_string(), e.is_retriable());
                }
            }
        }

        self.write(
            deadline,
            EventKind::Evaluation,
            &*self.context.evaluation_writer,
            &evaluation_rows,
        )
        .await;
        self.write(deadline, EventKind::Goal, &*self.context.goal_writer, &goal_rows)
            .await;

        debug!(
            worker = self.id,
            received,
            evaluation_rows = evaluation_rows.len(),
            goal_rows = goal_rows.len(),
            failed = fails.len(),
            "Flushed batch"
        );

        self.settle(messages, &fails).await;
    }

    async fn write<R: Send + Sync>(
        &self,
        deadline: Instant,
        kind: EventKind,
        writer: &dyn WarehouseWriter<R>,
        rows: &[R],
    ) {
        if rows.is_empty() {
            return;
        }

        let result = timeout_at(deadline, writer.append_rows(rows))
            .await
            .unwrap_or(Err(PersisterError::FlushTimeout));

        if let Err(e) = result {
            self.context.metrics.warehouse_write_failed(kind);
            error!(
                worker = self.id,
                event = %kind,
                rows = rows.len(),
                error = %e,
                "Failed to append rows to the warehouse"
            );
        }
    }

    /// One outcome per message: ids without a failure are acked, retriable failures nacked
    async fn settle(&self, messages: HashMap<String, Message>, fails: &HashMap<String, bool>) {
        for (id, message) in messages {
            match fails.get(&id) {
                Some(true) => {
                    message.nack().await;
                    self.context
                        .metrics
                        .message_handled(HandledCode::RepeatableError);
                }
                Some(false) => {
                    message.ack().await;
                    self.context
                        .metrics
                        .message_handled(HandledCode::NonRepeatableError);
                }
                None => {
                    message.ack().await;
                    self.context.metrics.message_handled(HandledCode::Ok);
                }
            }
        }
    }
}

fn log_conversion_failure(id: &str, environment: &str, kind: EventKind, err: &PersisterError) {
    match err {
        PersisterError::NoExperiments => warn!(
            id = %id,
            environment = %environment,
            event = %kind,
            "There are no running experiments"
        ),
        e if e.is_retriable() => warn!(
            id = %id,
            environment = %environment,
            event = %kind,
            error = %e,
            "Failed to convert event, will retry"
        ),
        e => error!(
            id = %id,
            environment = %environment,
            event = %kind,
            error = %e,
            "Failed to convert event"
        ),
    }
}
