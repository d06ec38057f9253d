use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use tracing::warn;

use crate::models::EventKind;

/// Outcome codes of `event_persister_handled_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandledCode {
    Ok,
    MissingId,
    DuplicateId,
    BadMessage,
    RepeatableError,
    NonRepeatableError,
    InvalidEventTimestamp,
    FailedToListExperiments,
    UserEvaluationNotFound,
    FailedToGetUserEvaluation,
    UpsertUserEvaluationFailed,
}

impl HandledCode {
    pub const ALL: [HandledCode; 11] = [
        HandledCode::Ok,
        HandledCode::MissingId,
        HandledCode::DuplicateId,
        HandledCode::BadMessage,
        HandledCode::RepeatableError,
        HandledCode::NonRepeatableError,
        HandledCode::InvalidEventTimestamp,
        HandledCode::FailedToListExperiments,
        HandledCode::UserEvaluationNotFound,
        HandledCode::FailedToGetUserEvaluation,
        HandledCode::UpsertUserEvaluationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandledCode::Ok => "OK",
            HandledCode::MissingId => "MissingID",
            HandledCode::DuplicateId => "DuplicateID",
            HandledCode::BadMessage => "BadMessage",
            HandledCode::RepeatableError => "RepeatableError",
            HandledCode::NonRepeatableError => "NonRepeatableError",
            HandledCode::InvalidEventTimestamp => "InvalidEventTimestamp",
            HandledCode::FailedToListExperiments => "FailedToListExperiments",
            HandledCode::UserEvaluationNotFound => "UserEvaluationNotFound",
            HandledCode::FailedToGetUserEvaluation => "FailedToGetUserEvaluation",
            HandledCode::UpsertUserEvaluationFailed => "UpsertUserEvaluationFailed",
        }
    }
}

/// Counters reported by one persister instance
pub trait PersisterMetrics: Send + Sync {
    fn message_received(&self);
    fn message_handled(&self, code: HandledCode);
    fn warehouse_write_failed(&self, kind: EventKind);
}

/// Prometheus counters registered on a caller-owned registry
#[derive(Clone)]
pub struct PrometheusMetrics {
    received: IntCounter,
    handled: IntCounterVec,
    write_failures: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry, service: &str) -> Result<Self, prometheus::Error> {
        let received = IntCounter::with_opts(
            Opts::new(
                "event_persister_received_total",
                "Total number of messages received from the subscription",
            )
            .const_label("service", service.to_string()),
        )?;

        let handled = IntCounterVec::new(
            Opts::new(
                "event_persister_handled_total",
                "Total number of messages settled, by outcome code",
            )
            .const_label("service", service.to_string()),
            &["code"],
        )?;

        let write_failures = IntCounterVec::new(
            Opts::new(
                "event_persister_warehouse_write_failures_total",
                "Total number of failed warehouse batch writes, by event kind",
            )
            .const_label("service", service.to_string()),
            &["event"],
        )?;

        // Export every code from the start, not only after its first hit.
        for code in HandledCode::ALL {
            handled.with_label_values(&[code.as_str()]);
        }

        for metric in [
            Box::new(received.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(handled.clone()),
            Box::new(write_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register event persister metric: {}", e);
            }
        }

        Ok(Self {
            received,
            handled,
            write_failures,
        })
    }
}

impl PersisterMetrics for PrometheusMetrics {
    fn message_received(&self) {
        self.received.inc();
    }

    fn message_handled(&self, code: HandledCode) {
        self.handled.with_label_values(&[code.as_str()]).inc();
    }

    fn warehouse_write_failed(&self, kind: EventKind) {
        self.write_failures
            .with_label_values(&[kind.as_str()])
            .inc();
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl PersisterMetrics for NoopMetrics {
    fn message_received(&self) {}
    fn message_handled(&self, _code: HandledCode) {}
    fn warehouse_write_failed(&self, _kind: EventKind) {}
}
