use thiserror::Error;

use tether_net::AuthError;
use tether_shared::{ServerId, SharedError};

/// Errors produced by the file transfer layer.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Transport-level failure talking to the file server.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The file server answered with a non-success status.
    #[error("{uri} answered {status}")]
    Status { status: u16, uri: String },

    /// No CDN URI is known for the server yet (not connected).
    #[error("File transfer for server {0} is not initialized")]
    NotInitialized(ServerId),

    /// No bearer token could be obtained.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A referenced hash has no file in the local cache.
    #[error("File not in local cache: {0}")]
    FileMissing(String),

    /// The local cache failed to produce data.
    #[error("Local cache error: {0}")]
    Cache(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Shared(#[from] SharedError),

    /// The transfer was cancelled. Never retried.
    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
