use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {key}: {source}")]
    Dial {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Idle connection to {key} failed: {source}")]
    IdleConnectionFault {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection pool has been destroyed")]
    Destroyed,

    #[error("Pending request was abandoned by the pool")]
    Cancelled,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// True when the error came from the transport refusing or failing a dial.
    pub fn is_dial(&self) -> bool {
        matches!(self, PoolError::Dial { .. })
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
