use thiserror::Error;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("http server error: {0}")]
    Io(#[from] std::io::Error),
}
