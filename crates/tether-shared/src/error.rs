use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid content hash: {0}")]
    InvalidHash(String),
}
