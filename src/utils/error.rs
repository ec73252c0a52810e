use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,

    #[error("connection pool timeout")]
    Timeout,

    #[error("dial error: {0}")]
    Dial(Arc<io::Error>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Underlying dialer error, if this is a dial failure.
    pub fn dial_error(&self) -> Option<&io::Error> {
        match self {
            PoolError::Dial(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
