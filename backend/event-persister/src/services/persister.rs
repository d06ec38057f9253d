use pubsub::{Puller, RateLimitedPuller};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::converter::EventConverter;
use super::extractor::EventExtractor;
use super::resolver::ExperimentResolver;
use super::task_group::TaskGroup;
use super::worker::{BatchOptions, BatchWorker, WorkerContext};
use crate::clients::ExperimentClient;
use crate::error::{PersisterError, Result};
use crate::health::{HealthCheck, HealthStatus};
use crate::metrics::{NoopMetrics, PersisterMetrics};
use crate::models::{EvaluationEventRow, GoalEventRow};
use crate::storage::{EvaluationStore, WarehouseWriter};
use crate::utils::{Clock, SystemClock};

pub const DEFAULT_MAX_MPS: u32 = 1000;
pub const DEFAULT_NUM_WORKERS: usize = 1;
pub const DEFAULT_FLUSH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(20);

/// Tunables of a [`Persister`]
#[derive(Clone)]
pub struct PersisterOptions {
    pub max_mps: u32,
    pub num_workers: usize,
    pub flush_size: usize,
    pub flush_interval: Duration,
    pub flush_timeout: Duration,
    pub metrics: Arc<dyn PersisterMetrics>,
    pub clock: Arc<dyn Clock>,
}

impl Default for PersisterOptions {
    fn default() -> Self {
        Self {
            max_mps: DEFAULT_MAX_MPS,
            num_workers: DEFAULT_NUM_WORKERS,
            flush_size: DEFAULT_FLUSH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        }
    }
}

impl PersisterOptions {
    pub fn with_max_mps(mut self, max_mps: u32) -> Self {
        self.max_mps = max_mps;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_flush_size(mut self, flush_size: usize) -> Self {
        self.flush_size = flush_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn PersisterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            flush_size: self.flush_size,
            flush_interval: self.flush_interval,
            flush_timeout: self.flush_timeout,
        }
    }

    fn validate(&self) -> Result<NonZeroU32> {
        if self.num_workers == 0 {
            return Err(PersisterError::Config("num_workers must be at least 1".into()));
        }
        if self.flush_size == 0 {
            return Err(PersisterError::Config("flush_size must be at least 1".into()));
        }
        if self.flush_interval.is_zero() || self.flush_timeout.is_zero() {
            return Err(PersisterError::Config(
                "flush_interval and flush_timeout must be positive".into(),
            ));
        }
        NonZeroU32::new(self.max_mps)
            .ok_or_else(|| PersisterError::Config("max_mps must be at least 1".into()))
    }
}

/// External systems the persister reads from and writes to
#[derive(Clone)]
pub struct Collaborators {
    pub puller: Arc<dyn Puller>,
    pub experiment_client: Arc<dyn ExperimentClient>,
    pub evaluation_store: Arc<dyn EvaluationStore>,
    pub evaluation_writer: Arc<dyn WarehouseWriter<EvaluationEventRow>>,
    pub goal_writer: Arc<dyn WarehouseWriter<GoalEventRow>>,
}

/// Pulls analytics events and persists them to the warehouse
///
/// One rate-limited puller feeds `num_workers` batch workers competing on a
/// shared receiver. `run` drives them until `stop` is called or the puller
/// fails.
pub struct Persister {
    puller: Arc<RateLimitedPuller>,
    context: WorkerContext,
    batch_options: BatchOptions,
    num_workers: usize,
    cancel: CancellationToken,
    finished: Arc<AtomicUsize>,
    started: AtomicBool,
    done: watch::Sender<bool>,
}

impl Persister {
    pub fn new(collaborators: Collaborators, options: PersisterOptions) -> Result<Self> {
        let max_mps = options.validate()?;
        let metrics = Arc::clone(&options.metrics);

        let resolver = Arc::new(ExperimentResolver::new(
            collaborators.experiment_client,
            collaborators.evaluation_store,
            Arc::clone(&metrics),
        ));
        let context = WorkerContext {
            extractor: Arc::new(EventExtractor::new(Arc::clone(&metrics))),
            converter: Arc::new(EventConverter::new(
                resolver,
                Arc::clone(&options.clock),
                Arc::clone(&metrics),
            )),
            evaluation_writer: collaborators.evaluation_writer,
            goal_writer: collaborators.goal_writer,
            metrics,
        };
        let (done, _) = watch::channel(false);

        Ok(Self {
            puller: Arc::new(RateLimitedPuller::new(collaborators.puller, max_mps)),
            context,
            batch_options: options.batch_options(),
            num_workers: options.num_workers,
            cancel: CancellationToken::new(),
            finished: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
            done,
        })
    }

    /// Run the puller and workers until stopped
    ///
    /// Returns the puller's error if the subscription is lost. A persister
    /// runs at most once.
    pub async fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PersisterError::Config("persister already started".into()));
        }
        if self.cancel.is_cancelled() {
            self.done.send_replace(true);
            return Ok(());
        }

        info!(
            workers = self.num_workers,
            flush_size = self.batch_options.flush_size,
            "Starting event persister"
        );

        let mut group = TaskGroup::new(self.cancel.clone(), Arc::clone(&self.finished));

        let puller = Arc::clone(&self.puller);
        let cancel = self.cancel.clone();
        group.spawn("puller", async move {
            puller.run(cancel).await.map_err(PersisterError::from)
        });

        for id in 0..self.num_workers {
            let worker = BatchWorker::new(
                id,
                self.puller.message_receiver(),
                self.context.clone(),
                self.batch_options,
            );
            group.spawn("worker", worker.run(self.cancel.clone()));
        }

        let result = group.wait().await;
        if let Err(e) = &result {
            error!(error = %e, "Event persister stopped with an error");
        } else {
            info!("Event persister stopped");
        }
        self.done.send_replace(true);
        result
    }

    /// Cancel every task and wait until `run` has drained them
    pub async fn stop(&self) {
        self.cancel.cancel();
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        let mut done = self.done.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = done.wait_for(|finished| *finished).await;
    }
}

impl HealthCheck for Persister {
    fn check(&self) -> HealthStatus {
        if self.cancel.is_cancelled() || self.finished.load(Ordering::SeqCst) > 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }
}
