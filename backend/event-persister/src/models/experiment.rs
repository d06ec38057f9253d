use serde::{Deserialize, Serialize};

/// Statuses an experiment can be linked from
pub const LINKABLE_STATUSES: [ExperimentStatus; 3] = [
    ExperimentStatus::Running,
    ExperimentStatus::ForceStopped,
    ExperimentStatus::Stopped,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub feature_id: String,
    pub feature_version: i32,
    #[serde(default)]
    pub goal_ids: Vec<String>,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub archived: bool,
}

impl Experiment {
    pub fn has_goal(&self, goal_id: &str) -> bool {
        self.goal_ids.iter().any(|id| id == goal_id)
    }

    pub fn is_linkable(&self) -> bool {
        !self.archived && LINKABLE_STATUSES.contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Waiting,
    Running,
    Stopped,
    ForceStopped,
}
