use thiserror::Error;
use tokio::task::JoinError;

use super::flags::WorkerRole;
use super::types::{FetchError, PersistError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{role} worker {index} stopped on {unit}: {source}")]
    WorkerFatal {
        role: WorkerRole,
        index: usize,
        unit: String,
        #[source]
        source: FetchError,
    },

    #[error("store operation failed: {0}")]
    Persist(#[from] PersistError),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] JoinError),

    #[error("Orchestration error: {0}")]
    Orchestration(String),
}
