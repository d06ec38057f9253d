use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::resolver::ExperimentResolver;
use crate::error::{PersisterError, Result};
use crate::metrics::{HandledCode, PersisterMetrics};
use crate::models::{
    tag_or_default, Evaluation, EvaluationEvent, EvaluationEventRow, GoalEvent, GoalEventRow,
    InnerEvent, User, WarehouseRow,
};
use crate::utils::Clock;

/// How far an event timestamp may drift from now, either way
pub const TIMESTAMP_WINDOW_HOURS: i64 = 24;

/// Turns decoded events into warehouse rows
pub struct EventConverter {
    resolver: Arc<ExperimentResolver>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn PersisterMetrics>,
}

impl EventConverter {
    pub fn new(
        resolver: Arc<ExperimentResolver>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn PersisterMetrics>,
    ) -> Self {
        Self {
            resolver,
            clock,
            metrics,
        }
    }

    pub async fn convert(
        &self,
        id: &str,
        environment: &str,
        event: &InnerEvent,
    ) -> Result<WarehouseRow> {
        match event {
            InnerEvent::Evaluation(evaluation) => self
                .convert_evaluation_event(id, environment, evaluation)
                .await
                .map(WarehouseRow::Evaluation),
            InnerEvent::Goal(goal) => self
                .convert_goal_event(id, environment, goal)
                .await
                .map(WarehouseRow::Goal),
        }
    }

    /// Validate an evaluation event, record the user's evaluation, and build its row
    pub async fn convert_evaluation_event(
        &self,
        id: &str,
        environment: &str,
        event: &EvaluationEvent,
    ) -> Result<EvaluationEventRow> {
        self.validate_timestamp(event.timestamp)?;

        let exists = self
            .resolver
            .exists_experiment(environment, &event.feature_id, event.feature_version)
            .await?;
        if !exists {
            return Err(PersisterError::NoExperiments);
        }

        let tag = tag_or_default(&event.tag);
        self.resolver
            .upsert_user_evaluation(&Evaluation::from_event(event), environment, tag)
            .await?;

        Ok(EvaluationEventRow {
            id: id.to_string(),
            feature_id: event.feature_id.clone(),
            feature_version: event.feature_version,
            user_id: event.user_id.clone(),
            user_data: user_data(event.user.as_ref())?,
            variation_id: event.variation_id.clone(),
            reason: event.reason.reason_type.to_string(),
            tag: tag.to_string(),
            source_id: event.source_id.as_str().to_string(),
            environment_namespace: environment.to_string(),
            timestamp: event.timestamp,
        })
    }

    /// Link a goal event to the evaluation the user saw, and build its row
    pub async fn convert_goal_event(
        &self,
        id: &str,
        environment: &str,
        event: &GoalEvent,
    ) -> Result<GoalEventRow> {
        let tag = tag_or_default(&event.tag);
        self.validate_timestamp(event.timestamp)?;

        let evaluation = self.link_goal_event(environment, tag, event).await?;

        Ok(GoalEventRow {
            id: id.to_string(),
            goal_id: event.goal_id.clone(),
            value: event.value as f32,
            user_id: event.user_id.clone(),
            user_data: user_data(event.user.as_ref())?,
            tag: tag.to_string(),
            source_id: event.source_id.as_str().to_string(),
            environment_namespace: environment.to_string(),
            timestamp: event.timestamp,
            feature_id: evaluation.feature_id,
            feature_version: evaluation.feature_version,
            variation_id: evaluation.variation_id,
            reason: evaluation.reason.reason_type.to_string(),
        })
    }

    async fn link_goal_event(
        &self,
        environment: &str,
        tag: &str,
        event: &GoalEvent,
    ) -> Result<Evaluation> {
        let experiments = self.resolver.list_active_experiments(environment).await?;
        if experiments.is_empty() {
            return Err(PersisterError::NoExperiments);
        }

        let experiment = ExperimentResolver::find_experiment_by_goal(&experiments, &event.goal_id)
            .ok_or(PersisterError::ExperimentNotFound)?;

        self.resolver
            .get_user_evaluation(
                environment,
                &event.user_id,
                tag,
                &experiment.feature_id,
                experiment.feature_version,
            )
            .await
    }

    fn validate_timestamp(&self, timestamp: i64) -> Result<()> {
        if let Err(e) = validate_timestamp(timestamp, self.clock.now()) {
            self.metrics
                .message_handled(HandledCode::InvalidEventTimestamp);
            return Err(e);
        }
        Ok(())
    }
}

/// Accept `timestamp` (unix seconds) within the window around `now`, bounds included
pub fn validate_timestamp(timestamp: i64, now: DateTime<Utc>) -> Result<()> {
    let window = Duration::hours(TIMESTAMP_WINDOW_HOURS);
    let at = DateTime::from_timestamp(timestamp, 0)
        .ok_or(PersisterError::InvalidEventTimestamp(timestamp))?;

    if at < now - window || at > now + window {
        return Err(PersisterError::InvalidEventTimestamp(timestamp));
    }
    Ok(())
}

/// User attributes as a JSON object; no user means an empty string
fn user_data(user: Option<&User>) -> Result<String> {
    match user {
        Some(user) => Ok(serde_json::to_string(&user.data)?),
        None => Ok(String::new()),
    }
}
