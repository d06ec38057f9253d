use std::sync::Arc;
use tracing::{debug, error, warn};

use super::single_flight::SingleFlight;
use crate::clients::{ExperimentClient, ListExperimentsRequest};
use crate::error::{PersisterError, Result};
use crate::metrics::{HandledCode, PersisterMetrics};
use crate::models::{Evaluation, Experiment, LINKABLE_STATUSES};
use crate::storage::EvaluationStore;

/// Page size used when walking the experiment list
pub const LIST_REQUEST_SIZE: u32 = 500;

/// Upstream lookup shared by concurrent callers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    ListExperiments,
    FindExperiment {
        feature_id: String,
        feature_version: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey {
    pub environment: String,
    pub operation: Operation,
}

type SharedExperiments = Result<Arc<Vec<Experiment>>>;

/// Resolves events against live experiment state and stored evaluations
pub struct ExperimentResolver {
    client: Arc<dyn ExperimentClient>,
    store: Arc<dyn EvaluationStore>,
    metrics: Arc<dyn PersisterMetrics>,
    flights: SingleFlight<CoalesceKey, SharedExperiments>,
}

impl ExperimentResolver {
    pub fn new(
        client: Arc<dyn ExperimentClient>,
        store: Arc<dyn EvaluationStore>,
        metrics: Arc<dyn PersisterMetrics>,
    ) -> Self {
        Self {
            client,
            store,
            metrics,
            flights: SingleFlight::new(),
        }
    }

    /// Whether exactly one linkable experiment runs `feature_id` at `feature_version`
    pub async fn exists_experiment(
        &self,
        environment: &str,
        feature_id: &str,
        feature_version: i32,
    ) -> Result<bool> {
        let key = CoalesceKey {
            environment: environment.to_string(),
            operation: Operation::FindExperiment {
                feature_id: feature_id.to_string(),
                feature_version,
            },
        };
        let request = ListExperimentsRequest {
            feature_id: Some(feature_id.to_string()),
            feature_version: Some(feature_version),
            page_size: 1,
            cursor: String::new(),
            environment: environment.to_string(),
            statuses: LINKABLE_STATUSES.to_vec(),
            archived: false,
        };

        let client = Arc::clone(&self.client);
        let experiments = self
            .flights
            .run(key, async move {
                let page = client.list_experiments(&request).await?;
                Ok(Arc::new(page.experiments))
            })
            .await
            .map_err(|e| {
                self.metrics
                    .message_handled(HandledCode::FailedToListExperiments);
                error!(
                    environment = %environment,
                    feature_id = %feature_id,
                    feature_version,
                    error = %e,
                    "Failed to look up experiment"
                );
                e
            })?;

        Ok(experiments.iter().filter(|exp| exp.is_linkable()).count() == 1)
    }

    /// Every linkable experiment in `environment`, walking all pages
    ///
    /// Concurrent callers for the same environment share one walk.
    pub async fn list_active_experiments(
        &self,
        environment: &str,
    ) -> Result<Arc<Vec<Experiment>>> {
        let key = CoalesceKey {
            environment: environment.to_string(),
            operation: Operation::ListExperiments,
        };
        let client = Arc::clone(&self.client);
        let env = environment.to_string();

        self.flights
            .run(key, async move { list_all_pages(client, env).await.map(Arc::new) })
            .await
            .map_err(|e| {
                self.metrics
                    .message_handled(HandledCode::FailedToListExperiments);
                error!(environment = %environment, error = %e, "Failed to list experiments");
                e
            })
    }

    /// First experiment in list order that declares `goal_id`
    pub fn find_experiment_by_goal<'a>(
        experiments: &'a [Experiment],
        goal_id: &str,
    ) -> Option<&'a Experiment> {
        experiments.iter().find(|exp| exp.has_goal(goal_id))
    }

    /// Every failure is retriable: the evaluation may simply not have landed yet.
    pub async fn get_user_evaluation(
        &self,
        environment: &str,
        user_id: &str,
        tag: &str,
        feature_id: &str,
        feature_version: i32,
    ) -> Result<Evaluation> {
        match self
            .store
            .get_user_evaluation(user_id, environment, tag, feature_id, feature_version)
            .await
        {
            Ok(evaluation) => Ok(evaluation),
            Err(PersisterError::EvaluationNotFound) => {
                self.metrics
                    .message_handled(HandledCode::UserEvaluationNotFound);
                warn!(
                    environment = %environment,
                    user_id = %user_id,
                    feature_id = %feature_id,
                    feature_version,
                    "User evaluation not found"
                );
                Err(PersisterError::EvaluationNotFound)
            }
            Err(e) => {
                self.metrics
                    .message_handled(HandledCode::FailedToGetUserEvaluation);
                error!(
                    environment = %environment,
                    user_id = %user_id,
                    error = %e,
                    "Failed to get user evaluation"
                );
                Err(match e {
                    PersisterError::Storage(_) | PersisterError::FlushTimeout => e,
                    other => PersisterError::Storage(other.to_string()),
                })
            }
        }
    }

    pub async fn upsert_user_evaluation(
        &self,
        evaluation: &Evaluation,
        environment: &str,
        tag: &str,
    ) -> Result<()> {
        self.store
            .upsert_user_evaluation(evaluation, environment, tag)
            .await
            .map_err(|e| {
                self.metrics
                    .message_handled(HandledCode::UpsertUserEvaluationFailed);
                error!(
                    environment = %environment,
                    evaluation_id = %evaluation.id,
                    error = %e,
                    "Failed to upsert user evaluation"
                );
                match e {
                    PersisterError::Storage(_) | PersisterError::FlushTimeout => e,
                    other => PersisterError::Storage(other.to_string()),
                }
            })
    }
}

async fn list_all_pages(
    client: Arc<dyn ExperimentClient>,
    environment: String,
) -> Result<Vec<Experiment>> {
    let mut experiments = Vec::new();
    let mut cursor = String::new();

    loop {
        let request = ListExperimentsRequest {
            feature_id: None,
            feature_version: None,
            page_size: LIST_REQUEST_SIZE,
            cursor,
            environment: environment.clone(),
            statuses: LINKABLE_STATUSES.to_vec(),
            archived: false,
        };
        let page = client.list_experiments(&request).await?;
        let size = page.experiments.len();
        // The service filter is advisory; keep only what can take events
        experiments.extend(page.experiments.into_iter().filter(Experiment::is_linkable));

        if size == 0 || size < LIST_REQUEST_SIZE as usize || page.cursor.is_empty() {
            break;
        }
        cursor = page.cursor;
    }

    debug!(
        environment = %environment,
        count = experiments.len(),
        "Listed active experiments"
    );
    Ok(experiments)
}
