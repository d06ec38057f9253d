use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Settles a delivered message back on the queue
///
/// Implementations carry whatever the queue needs to identify the delivery
/// (stream key, entry id, ...). Failures are logged by the implementation;
/// the caller has already decided the outcome and does not retry.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Permanently remove the message from the queue
    async fn ack(&self);

    /// Leave the message for redelivery
    async fn nack(&self);
}

/// A message delivered by a [`Puller`](crate::Puller)
///
/// `ack` and `nack` take `self`, so a message can be settled at most once.
/// Dropping a message without settling it abandons it: the queue redelivers
/// it after its own visibility timeout.
pub struct Message {
    /// Queue-level identifier of this delivery
    pub id: String,
    /// Publisher-supplied attributes (the event id travels as `id`)
    pub attributes: HashMap<String, String>,
    /// Raw payload
    pub data: Vec<u8>,
    acknowledger: Box<dyn Acknowledger>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        attributes: HashMap<String, String>,
        data: Vec<u8>,
        acknowledger: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            id: id.into(),
            attributes,
            data,
            acknowledger,
        }
    }

    /// Look up an attribute, treating an empty value as absent
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub async fn ack(self) {
        self.acknowledger.ack().await;
    }

    pub async fn nack(self) {
        self.acknowledger.nack().await;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attributes", &self.attributes)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Receiving half of a message channel, shared by competing consumers
///
/// Cloning hands out another handle to the same queue; each message is
/// received by exactly one handle.
#[derive(Clone)]
pub struct MessageReceiver {
    inner: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl MessageReceiver {
    pub fn new(receiver: mpsc::Receiver<Message>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Wait for the next message. Returns `None` once every sender is gone.
    ///
    /// Cancel-safe: dropping the future before it resolves loses no message.
    pub async fn recv(&self) -> Option<Message> {
        self.inner.lock().await.recv().await
    }
}

/// Create a bounded channel whose receiver can be shared between workers
pub fn message_channel(capacity: usize) -> (mpsc::Sender<Message>, MessageReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, MessageReceiver::new(rx))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Outcome {
        Ack,
        Nack,
    }

    pub(crate) type Outcomes = Arc<StdMutex<Vec<(String, Outcome)>>>;

    pub(crate) struct RecordingAcknowledger {
        pub(crate) id: String,
        pub(crate) outcomes: Outcomes,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcknowledger {
        async fn ack(&self) {
            self.outcomes.lock().unwrap().push((self.id.clone(), Outcome::Ack));
        }

        async fn nack(&self) {
            self.outcomes.lock().unwrap().push((self.id.clone(), Outcome::Nack));
        }
    }

    pub(crate) fn recorded_message(id: &str, outcomes: &Outcomes) -> Message {
        Message::new(
            id,
            HashMap::from([("id".to_string(), id.to_string())]),
            id.as_bytes().to_vec(),
            Box::new(RecordingAcknowledger {
                id: id.to_string(),
                outcomes: Arc::clone(outcomes),
            }),
        )
    }

    #[tokio::test]
    async fn test_ack_and_nack_are_recorded_once() {
        let outcomes = Outcomes::default();

        recorded_message("a", &outcomes).ack().await;
        recorded_message("b", &outcomes).nack().await;

        let recorded = outcomes.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![
                ("a".to_string(), Outcome::Ack),
                ("b".to_string(), Outcome::Nack)
            ]
        );
    }

    #[test]
    fn test_empty_attribute_is_absent() {
        let outcomes = Outcomes::default();
        let mut message = recorded_message("a", &outcomes);
        assert_eq!(message.attribute("id"), Some("a"));

        message.attributes.insert("id".to_string(), String::new());
        assert_eq!(message.attribute("id"), None);
        assert_eq!(message.attribute("missing"), None);
    }

    #[tokio::test]
    async fn test_shared_receiver_delivers_each_message_once() {
        let outcomes = Outcomes::default();
        let (tx, rx) = message_channel(8);
        let other = rx.clone();

        for id in ["1", "2", "3", "4"] {
            tx.send(recorded_message(id, &outcomes)).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        loop {
            let next = tokio::select! {
                m = rx.recv() => m,
                m = other.recv() => m,
            };
            match next {
                Some(m) => seen.push(m.id.clone()),
                None => break,
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["1", "2", "3", "4"]);
    }
}
