pub mod converter;
pub mod extractor;
pub mod persister;
pub mod resolver;
pub mod single_flight;
pub mod task_group;
pub mod worker;

pub use converter::{validate_timestamp, EventConverter};
pub use extractor::{decode_envelope, EventExtractor, ExtractedBatch};
pub use persister::{Collaborators, Persister, PersisterOptions};
pub use resolver::{CoalesceKey, ExperimentResolver, Operation};
pub use single_flight::SingleFlight;
pub use task_group::TaskGroup;
pub use worker::{BatchOptions, BatchWorker, WorkerContext};
