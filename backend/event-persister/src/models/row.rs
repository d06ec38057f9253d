use clickhouse::Row;
use serde::{Deserialize, Serialize};

/// Row of the `evaluation_event` table
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct EvaluationEventRow {
    pub id: String,
    pub feature_id: String,
    pub feature_version: i32,
    pub user_id: String,
    pub user_data: String,
    pub variation_id: String,
    pub reason: String,
    pub tag: String,
    pub source_id: String,
    pub environment_namespace: String,
    pub timestamp: i64,
}

/// Row of the `goal_event` table, joined with the user's evaluation
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct GoalEventRow {
    pub id: String,
    pub goal_id: String,
    pub value: f32,
    pub user_id: String,
    pub user_data: String,
    pub tag: String,
    pub source_id: String,
    pub environment_namespace: String,
    pub timestamp: i64,
    pub feature_id: String,
    pub feature_version: i32,
    pub variation_id: String,
    pub reason: String,
}

/// A converted event, ready for its warehouse table
#[derive(Debug, Clone, PartialEq)]
pub enum WarehouseRow {
    Evaluation(EvaluationEventRow),
    Goal(GoalEventRow),
}
