use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outer wrapper published on the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub environment: String,
    #[serde(default)]
    pub timestamp: i64,
    pub event: InnerEvent,
}

/// The analytics payload carried by an [`Envelope`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InnerEvent {
    Evaluation(EvaluationEvent),
    Goal(GoalEvent),
}

impl InnerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InnerEvent::Evaluation(_) => EventKind::Evaluation,
            InnerEvent::Goal(_) => EventKind::Goal,
        }
    }
}

/// Warehouse table family an event lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Evaluation,
    Goal,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Evaluation => "evaluation_event",
            EventKind::Goal => "goal_event",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flag was evaluated for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationEvent {
    pub feature_id: String,
    pub feature_version: i32,
    pub user_id: String,
    pub variation_id: String,
    #[serde(default)]
    pub reason: Reason,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub user: Option<User>,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub source_id: SourceId,
}

/// A user reached a goal (conversion)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalEvent {
    pub goal_id: String,
    pub user_id: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub user: Option<User>,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub source_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reason {
    #[serde(rename = "type", default)]
    pub reason_type: ReasonType,
    #[serde(default)]
    pub rule_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonType {
    #[default]
    Target,
    Rule,
    Default,
    Client,
    OffVariation,
    Prerequisite,
}

impl ReasonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonType::Target => "TARGET",
            ReasonType::Rule => "RULE",
            ReasonType::Default => "DEFAULT",
            ReasonType::Client => "CLIENT",
            ReasonType::OffVariation => "OFF_VARIATION",
            ReasonType::Prerequisite => "PREREQUISITE",
        }
    }
}

impl fmt::Display for ReasonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDK or service that emitted the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceId {
    Android,
    Ios,
    Web,
    GoalBatch,
    GoServer,
    NodeServer,
    JavaScript,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Unknown => "UNKNOWN",
            SourceId::Android => "ANDROID",
            SourceId::Ios => "IOS",
            SourceId::Web => "WEB",
            SourceId::GoalBatch => "GOAL_BATCH",
            SourceId::GoServer => "GO_SERVER",
            SourceId::NodeServer => "NODE_SERVER",
            SourceId::JavaScript => "JAVA_SCRIPT",
        }
    }
}
