//! Error types for taskq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing store failed or is unreachable.
    #[error("store error: {0}")]
    Store(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A target names a function missing from the worker's registry.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Store failures are the only ones a loop should sleep and retry on.
    pub fn is_store(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
