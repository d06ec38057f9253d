pub mod evaluation_store;
pub mod warehouse;

pub use evaluation_store::{user_evaluation_key, EvaluationStore, RedisEvaluationStore};
pub use warehouse::{ClickHouseWriter, WarehouseWriter};
