use thiserror::Error;

pub type AdaptResult<T> = Result<T, AdaptError>;

#[derive(Error, Debug)]
pub enum AdaptError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
