use thiserror::Error;

/// Enumeration of errors for operations against the processing queue.
/// Errors that originate from sqlx are wrapped to provide additional context,
/// mirroring the error taxonomy of a hand-rolled Postgres-backed queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("job {0} not found")]
    JobNotFound(i64),
    #[error("job {0} cannot be retried from its current status")]
    NotRetryable(i64),
}

impl QueueError {
    pub(crate) fn query(command: &str, error: sqlx::Error) -> Self {
        QueueError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

/// Enumeration of errors for operations against the chart store.
#[derive(Error, Debug)]
pub enum ChartError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("chart {0} not found")]
    ChartNotFound(String),
    #[error("chart {0} cannot transition out of {1:?} via this operation")]
    InvalidTransition(String, crate::models::AiStatus),
}

impl ChartError {
    pub(crate) fn query(command: &str, error: sqlx::Error) -> Self {
        ChartError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

/// Errors raised by the external collaborators described in the specification's
/// "external interfaces" section (OCR, LLM, blob store, DOCX extractor).
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("blob store I/O failed: {0}")]
    BlobIo(String),
    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("AI synthesis failed: {0}")]
    AiFailed(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}
