use std::path::PathBuf;

use thiserror::Error;

use tether_files::TransferError;
use tether_net::{AuthError, SessionError};
use tether_shared::ServerId;

/// Errors loading or saving configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to determine a platform data directory.
    #[error("No platform configuration directory available")]
    NoConfigDir,

    /// Reading or writing a config file failed.
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config file exists but is not valid JSON for its type.
    #[error("Malformed configuration {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serializing a config document failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors produced by the client core.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No configured server has this identity.
    #[error("Unknown server: {0}")]
    UnknownServer(ServerId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
