use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::{PersisterError, Result};
use crate::models::Evaluation;

/// Durable store of users' resolved flag evaluations
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Fails with [`PersisterError::EvaluationNotFound`] when nothing is stored for the key
    async fn get_user_evaluation(
        &self,
        user_id: &str,
        environment: &str,
        tag: &str,
        feature_id: &str,
        feature_version: i32,
    ) -> Result<Evaluation>;

    /// Last write wins per key
    async fn upsert_user_evaluation(
        &self,
        evaluation: &Evaluation,
        environment: &str,
        tag: &str,
    ) -> Result<()>;
}

pub fn user_evaluation_key(
    environment: &str,
    tag: &str,
    user_id: &str,
    feature_id: &str,
    feature_version: i32,
) -> String {
    format!("user_evaluation:{environment}:{tag}:{user_id}:{feature_id}:{feature_version}")
}

/// [`EvaluationStore`] keeping one JSON value per key in Redis
#[derive(Clone)]
pub struct RedisEvaluationStore {
    conn: ConnectionManager,
}

impl RedisEvaluationStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(client: redis::Client) -> Result<Self> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl EvaluationStore for RedisEvaluationStore {
    async fn get_user_evaluation(
        &self,
        user_id: &str,
        environment: &str,
        tag: &str,
        feature_id: &str,
        feature_version: i32,
    ) -> Result<Evaluation> {
        let key = user_evaluation_key(environment, tag, user_id, feature_id, feature_version);
        let mut conn = self.conn.clone();

        let value: Option<String> = conn.get(&key).await?;
        let value = value.ok_or(PersisterError::EvaluationNotFound)?;

        serde_json::from_str(&value)
            .map_err(|e| PersisterError::Storage(format!("corrupt evaluation at {}: {}", key, e)))
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
        let value = serde_json::to_string(evaluation)?;
        let mut conn = self.conn.clone();

        conn.set::<_, _, ()>(&key, value).await?;
        debug!(key = %key, "Upserted user evaluation");
        Ok(())
    }
}
