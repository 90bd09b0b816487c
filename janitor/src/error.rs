use thiserror::Error;

#[derive(Error, Debug)]
pub enum JanitorError {
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("queue store error: {0}")]
    Queue(#[from] chartflow_core::error::QueueError),
}
