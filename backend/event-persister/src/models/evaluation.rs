use serde::{Deserialize, Serialize};

use super::event::{EvaluationEvent, Reason};

/// Tag recorded for events from SDKs that do not send one
pub const DEFAULT_TAG: &str = "none";

/// A user's resolved flag evaluation, as kept in the evaluation store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub id: String,
    pub feature_id: String,
    pub feature_version: i32,
    pub user_id: String,
    pub variation_id: String,
    #[serde(default)]
    pub reason: Reason,
}

impl Evaluation {
    pub fn from_event(event: &EvaluationEvent) -> Self {
        Self {
            id: evaluation_id(&event.feature_id, event.feature_version, &event.user_id),
            feature_id: event.feature_id.clone(),
            feature_version: event.feature_version,
            user_id: event.user_id.clone(),
            variation_id: event.variation_id.clone(),
            reason: event.reason.clone(),
        }
    }
}

/// Deterministic id of the evaluation of one flag version for one user
pub fn evaluation_id(feature_id: &str, feature_version: i32, user_id: &str) -> String {
    format!("{feature_id}:{feature_version}:{user_id}")
}

pub fn tag_or_default(tag: &str) -> &str {
    if tag.is_empty() {
        DEFAULT_TAG
    } else {
        tag
    }
}
