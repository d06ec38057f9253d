pub mod experiment;

pub use experiment::{
    ExperimentClient, HttpExperimentClient, ListExperimentsRequest, ListExperimentsResponse,
};
