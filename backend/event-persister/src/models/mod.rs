pub mod evaluation;
pub mod event;
pub mod experiment;
pub mod row;

pub use evaluation::{evaluation_id, tag_or_default, Evaluation, DEFAULT_TAG};
pub use event::{
    Envelope, EvaluationEvent, EventKind, GoalEvent, InnerEvent, Reason, ReasonType, SourceId,
    User,
};
pub use experiment::{Experiment, ExperimentStatus, LINKABLE_STATUSES};
pub use row::{EvaluationEventRow, GoalEventRow, WarehouseRow};
