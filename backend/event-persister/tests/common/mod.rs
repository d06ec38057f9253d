//! In-memory collaborators for persister integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use event_persister::clients::{ExperimentClient, ListExperimentsRequest, ListExperimentsResponse};
use event_persister::metrics::{HandledCode, PersisterMetrics};
use event_persister::models::{
    Evaluation, EventKind, Experiment, ExperimentStatus, Reason, ReasonType,
};
use event_persister::services::{
    BatchOptions, EventConverter, EventExtractor, ExperimentResolver, WorkerContext,
};
use event_persister::{Collaborators, PersisterOptions};
use event_persister::storage::{user_evaluation_key, EvaluationStore, WarehouseWriter};
use event_persister::utils::FixedClock;
use event_persister::{PersisterError, Result};
use pubsub::{Acknowledger, Message, Puller, PullerError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const NOW: i64 = 1_700_000_000;
pub const ENVIRONMENT: &str = "production";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack,
}

#[derive(Clone, Default)]
pub struct Outcomes(Arc<Mutex<Vec<(String, Outcome)>>>);

impl Outcomes {
    pub fn all(&self) -> Vec<(String, Outcome)> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn of(&self, label: &str) -> Vec<Outcome> {
        self.all()
            .into_iter()
            .filter(|(l, _)| l == label)
            .map(|(_, outcome)| outcome)
            .collect()
    }

    /// Poll until `count` outcomes were recorded
    pub async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {} outcomes, got {:?}", count, self.all()));
    }
}

struct RecordingAcknowledger {
    label: String,
    outcomes: Outcomes,
}

#[async_trait]
impl Acknowledger for RecordingAcknowledger {
    async fn ack(&self) {
        self.outcomes
            .0
            .lock()
            .unwrap()
            .push((self.label.clone(), Outcome::Ack));
    }

    async fn nack(&self) {
        self.outcomes
            .0
            .lock()
            .unwrap()
            .push((self.label.clone(), Outcome::Nack));
    }
}

/// A message whose outcome is recorded under `label`
pub fn message(label: &str, id: Option<&str>, payload: Vec<u8>, outcomes: &Outcomes) -> Message {
    let mut attributes = HashMap::new();
    if let Some(id) = id {
        attributes.insert("id".to_string(), id.to_string());
    }
    Message::new(
        label,
        attributes,
        payload,
        Box::new(RecordingAcknowledger {
            label: label.to_string(),
            outcomes: outcomes.clone(),
        }),
    )
}

pub fn evaluation_payload(feature_id: &str, user_id: &str, variation_id: &str, timestamp: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("{feature_id}-{user_id}"),
        "environment": ENVIRONMENT,
        "timestamp": timestamp,
        "event": {
            "type": "evaluation",
            "featureId": feature_id,
            "featureVersion": 1,
            "userId": user_id,
            "variationId": variation_id,
            "reason": {"type": "DEFAULT"},
            "timestamp": timestamp,
            "sourceId": "WEB"
        }
    }))
    .unwrap()
}

pub fn goal_payload(goal_id: &str, user_id: &str, tag: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("{goal_id}-{user_id}"),
        "environment": ENVIRONMENT,
        "timestamp": NOW,
        "event": {
            "type": "goal",
            "goalId": goal_id,
            "userId": user_id,
            "value": 1.0,
            "tag": tag,
            "timestamp": NOW,
            "sourceId": "GOAL_BATCH"
        }
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Puller
// ---------------------------------------------------------------------------

/// Forwards whatever the test pushes into the returned sender
pub struct ChannelPuller {
    source: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    fail: tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
}

impl ChannelPuller {
    pub fn new() -> (Self, mpsc::Sender<Message>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                source: tokio::sync::Mutex::new(rx),
                fail: tokio::sync::Mutex::new(None),
            },
            tx,
        )
    }

    /// The subscription fails once the returned sender fires
    pub fn failing() -> (Self, mpsc::Sender<Message>, tokio::sync::oneshot::Sender<()>) {
        let (puller, tx) = Self::new();
        let (fail_tx, fail_rx) = tokio::sync::oneshot::channel();
        *puller.fail.try_lock().unwrap() = Some(fail_rx);
        (puller, tx, fail_tx)
    }
}

#[async_trait]
impl Puller for ChannelPuller {
    async fn pull(
        &self,
        cancel: CancellationToken,
        sink: mpsc::Sender<Message>,
    ) -> std::result::Result<(), PullerError> {
        let mut source = self.source.lock().await;
        let fail = self.fail.lock().await.take();
        let fail = async move {
            match fail {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(fail);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = &mut fail => {
                    return Err(PullerError::SubscriptionLost {
                        consecutive_errors: 10,
                        last_error: "connection reset by peer".to_string(),
                    });
                }
                message = source.recv() => match message {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {
                        cancel.cancelled().await;
                        return Ok(());
                    }
                },
            }
        }
    }

    fn subscription_name(&self) -> String {
        "test:channel".to_string()
    }
}

// ---------------------------------------------------------------------------
// Experiment service
// ---------------------------------------------------------------------------

pub fn running_experiment(feature_id: &str, goal_ids: &[&str]) -> Experiment {
    Experiment {
        id: format!("exp-{feature_id}"),
        feature_id: feature_id.to_string(),
        feature_version: 1,
        goal_ids: goal_ids.iter().map(|g| g.to_string()).collect(),
        status: ExperimentStatus::Running,
        archived: false,
    }
}

/// Serves a fixed experiment list, filtering like the real service
pub struct FakeExperimentClient {
    experiments: Vec<Experiment>,
    delay: Duration,
    calls: AtomicUsize,
    failing: bool,
}

impl FakeExperimentClient {
    pub fn new(experiments: Vec<Experiment>) -> Self {
        Self {
            experiments,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            failing: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new(vec![])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExperimentClient for FakeExperimentClient {
    async fn list_experiments(
        &self,
        request: &ListExperimentsRequest,
    ) -> Result<ListExperimentsResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing {
            return Err(PersisterError::ExperimentClient("unavailable".to_string()));
        }

        let experiments = self
            .experiments
            .iter()
            .filter(|exp| exp.is_linkable())
            .filter(|exp| {
                request
                    .feature_id
                    .as_ref()
                    .map_or(true, |fid| &exp.feature_id == fid)
                    && request
                        .feature_version
                        .map_or(true, |version| exp.feature_version == version)
            })
            .cloned()
            .collect();

        Ok(ListExperimentsResponse {
            experiments,
            cursor: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Evaluation store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryEvaluationStore {
    evaluations: Mutex<HashMap<String, Evaluation>>,
}

impl InMemoryEvaluationStore {
    pub fn with_evaluation(self, environment: &str, tag: &str, evaluation: Evaluation) -> Self {
        let key = user_evaluation_key(
            environment,
            tag,
            &evaluation.user_id,
            &evaluation.feature_id,
            evaluation.feature_version,
        );
        self.evaluations.lock().unwrap().insert(key, evaluation);
        self
    }

    pub fn len(&self) -> usize {
        self.evaluations.lock().unwrap().len()
    }
}

#[async_trait]
impl EvaluationStore for InMemoryEvaluationStore {
    async fn get_user_evaluation(
        &self,
        user_id: &str,
        environment: &str,
        tag: &str,
        feature_id: &str,
        feature_version: i32,
    ) -> Result<Evaluation> {
        let key = user_evaluation_key(environment, tag, user_id, feature_id, feature_version);
        self.evaluations
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(PersisterError::EvaluationNotFound)
    }

    async fn upsert_user_evaluation(
        &self,
        evaluation: &Evaluation,
        environment: &str,
        tag: &str,
    ) -> Result<()> {
        let key = user_evaluation_key(
            environment,
            tag,
            &evaluation.user_id,
            &evaluation.feature_id,
            evaluation.feature_version,
        );
        self.evaluations
            .lock()
            .unwrap()
            .insert(key, evaluation.clone());
        Ok(())
    }
}

pub fn evaluation(feature_id: &str, user_id: &str, variation_id: &str) -> Evaluation {
    Evaluation {
        id: format!("{feature_id}:1:{user_id}"),
        feature_id: feature_id.to_string(),
        feature_version: 1,
        user_id: user_id.to_string(),
        variation_id: variation_id.to_string(),
        reason: Reason {
            reason_type: ReasonType::Rule,
            rule_id: "rule-1".to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Warehouse
// ---------------------------------------------------------------------------

pub struct RecordingWriter<R> {
    rows: Mutex<Vec<R>>,
    failing: bool,
}

impl<R> RecordingWriter<R> {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            failing: true,
        }
    }
}

impl<R: Clone> RecordingWriter<R> {
    pub fn rows(&self) -> Vec<R> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl<R: Clone + Send + Sync> WarehouseWriter<R> for RecordingWriter<R> {
    async fn append_rows(&self, rows: &[R]) -> Result<()> {
        if self.failing {
            return Err(PersisterError::Warehouse("table is read-only".to_string()));
        }
        self.rows.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CountingMetrics {
    received: AtomicUsize,
    handled: Mutex<HashMap<HandledCode, usize>>,
    write_failures: Mutex<HashMap<EventKind, usize>>,
}

impl CountingMetrics {
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn handled(&self, code: HandledCode) -> usize {
        self.handled.lock().unwrap().get(&code).copied().unwrap_or(0)
    }

    pub fn write_failures(&self, kind: EventKind) -> usize {
        self.write_failures
            .lock()
            .unwrap()
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}

impl PersisterMetrics for CountingMetrics {
    fn message_received(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    fn message_handled(&self, code: HandledCode) {
        *self.handled.lock().unwrap().entry(code).or_default() += 1;
    }

    fn warehouse_write_failed(&self, kind: EventKind) {
        *self.write_failures.lock().unwrap().entry(kind).or_default() += 1;
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Collaborators of one test, kept around for assertions
pub struct Harness {
    pub client: Arc<FakeExperimentClient>,
    pub store: Arc<InMemoryEvaluationStore>,
    pub evaluation_writer: Arc<RecordingWriter<event_persister::models::EvaluationEventRow>>,
    pub goal_writer: Arc<RecordingWriter<event_persister::models::GoalEventRow>>,
    pub metrics: Arc<CountingMetrics>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new(client: FakeExperimentClient, store: InMemoryEvaluationStore) -> Self {
        Self {
            client: Arc::new(client),
            store: Arc::new(store),
            evaluation_writer: Arc::new(RecordingWriter::new()),
            goal_writer: Arc::new(RecordingWriter::new()),
            metrics: Arc::new(CountingMetrics::default()),
            clock: Arc::new(FixedClock::at_unix(NOW).unwrap()),
        }
    }

    pub fn with_failing_warehouse(mut self) -> Self {
        self.evaluation_writer = Arc::new(RecordingWriter::failing());
        self.goal_writer = Arc::new(RecordingWriter::failing());
        self
    }

    pub fn collaborators(&self, puller: Arc<dyn Puller>) -> Collaborators {
        Collaborators {
            puller,
            experiment_client: self.client.clone(),
            evaluation_store: self.store.clone(),
            evaluation_writer: self.evaluation_writer.clone(),
            goal_writer: self.goal_writer.clone(),
        }
    }

    pub fn options(&self, flush_size: usize) -> PersisterOptions {
        PersisterOptions::default()
            .with_flush_size(flush_size)
            .with_flush_interval(Duration::from_secs(60))
            .with_metrics(self.metrics.clone())
            .with_clock(self.clock.clone())
    }

    pub fn worker_context(&self) -> WorkerContext {
        let resolver = Arc::new(ExperimentResolver::new(
            self.client.clone(),
            self.store.clone(),
            self.metrics.clone(),
        ));
        WorkerContext {
            extractor: Arc::new(EventExtractor::new(self.metrics.clone())),
            converter: Arc::new(EventConverter::new(
                resolver,
                self.clock.clone(),
                self.metrics.clone(),
            )),
            evaluation_writer: self.evaluation_writer.clone(),
            goal_writer: self.goal_writer.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

pub fn batch_options(flush_size: usize) -> BatchOptions {
    BatchOptions {
        flush_size,
        flush_interval: Duration::from_secs(5),
        flush_timeout: Duration::from_secs(20),
    }
}
