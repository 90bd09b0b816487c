use chartflow_core::error::{ChartError, CollaboratorError, QueueError};
use thiserror::Error;

/// The per-job error thrown from the five processing phases. The worker's
/// top-level match on this only produces a human-readable `error_message`
/// string -- whether the job actually gets retried is decided entirely by
/// `QueueStore::fail`'s return value, never duplicated here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no text could be extracted from any of {attempted} document(s)")]
    NoDocumentsExtracted { attempted: usize },
    #[error("AI collaborator error: {0}")]
    Ai(#[from] CollaboratorError),
    #[error("failed to persist chart state: {0}")]
    Persist(#[from] ChartError),
    #[error("queue store error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors related to initialization and the top-level run loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred: {0}")]
    Queue(#[from] QueueError),
    #[error("a database error occurred: {0}")]
    Chart(#[from] ChartError),
}
