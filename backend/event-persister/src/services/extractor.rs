use pubsub::Message;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::error;

use crate::error::{PersisterError, Result};
use crate::metrics::{HandledCode, PersisterMetrics};
use crate::models::{Envelope, InnerEvent};

/// environment -> (message id -> event)
pub type EnvironmentEvents = BTreeMap<String, BTreeMap<String, InnerEvent>>;

/// Decoded events plus the messages still awaiting an outcome
#[derive(Debug, Default)]
pub struct ExtractedBatch {
    pub events: EnvironmentEvents,
    pub messages: HashMap<String, Message>,
}

pub struct EventExtractor {
    metrics: Arc<dyn PersisterMetrics>,
}

impl EventExtractor {
    pub fn new(metrics: Arc<dyn PersisterMetrics>) -> Self {
        Self { metrics }
    }

    /// Decode every message of a batch
    ///
    /// Messages whose payload does not decode are acked on the spot and left
    /// out of the result.
    pub async fn extract(&self, messages: HashMap<String, Message>) -> ExtractedBatch {
        let mut batch = ExtractedBatch::default();

        for (id, message) in messages {
            match decode_envelope(&message.data) {
                Ok(envelope) => {
                    batch
                        .events
                        .entry(envelope.environment)
                        .or_default()
                        .insert(id.clone(), envelope.event);
                    batch.messages.insert(id, message);
                }
                Err(e) => {
                    error!(id = %id, error = %e, "Failed to decode event envelope");
                    message.ack().await;
                    self.metrics.message_handled(HandledCode::BadMessage);
                }
            }
        }

        batch
    }
}

pub fn decode_envelope(data: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(data).map_err(|e| PersisterError::BadMessage(e.to_string()))
}
