use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PullerError;
use crate::message::{message_channel, Message, MessageReceiver};

/// A raw queue subscription
#[async_trait]
pub trait Puller: Send + Sync {
    /// Deliver messages into `sink` until `cancel` fires or the subscription
    /// fails. Returns `Ok(())` on cancellation or when `sink` is closed.
    async fn pull(
        &self,
        cancel: CancellationToken,
        sink: mpsc::Sender<Message>,
    ) -> Result<(), PullerError>;

    /// Human-readable subscription name for logs
    fn subscription_name(&self) -> String;
}

/// Throttles a [`Puller`] to a maximum sustained messages-per-second rate
///
/// The rate is enforced here, independent of the queue's own flow control,
/// so bursts never reach downstream sinks faster than `max_mps`. Messages
/// still in flight when `run` is cancelled are dropped unsettled and come
/// back through queue redelivery.
pub struct RateLimitedPuller {
    puller: Arc<dyn Puller>,
    limiter: DefaultDirectRateLimiter,
    max_mps: NonZeroU32,
    tx: mpsc::Sender<Message>,
    rx: MessageReceiver,
}

impl RateLimitedPuller {
    pub fn new(puller: Arc<dyn Puller>, max_mps: NonZeroU32) -> Self {
        let (tx, rx) = message_channel(1);
        Self {
            puller,
            limiter: RateLimiter::direct(Quota::per_second(max_mps)),
            max_mps,
            tx,
            rx,
        }
    }

    /// Handle for workers; every clone competes for the same messages
    pub fn message_receiver(&self) -> MessageReceiver {
        self.rx.clone()
    }

    /// Run the subscription until `cancel` fires or the underlying puller fails
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PullerError> {
        info!(
            subscription = %self.puller.subscription_name(),
            max_mps = self.max_mps.get(),
            "Starting rate-limited puller"
        );

        let (raw_tx, mut raw_rx) = mpsc::channel(1);
        let pull = self.puller.pull(cancel.clone(), raw_tx);
        tokio::pin!(pull);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Rate-limited puller cancelled");
                    return Ok(());
                }
                result = &mut pull => {
                    return result;
                }
                Some(message) = raw_rx.recv() => {
                    if !self.forward(&cancel, message).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Wait for a rate-limit slot and hand the message to the workers.
    /// Returns false when the puller should stop.
    async fn forward(&self, cancel: &CancellationToken, message: Message) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = self.limiter.until_ready() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.tx.send(message) => sent.is_ok(),
        }
    }
}
