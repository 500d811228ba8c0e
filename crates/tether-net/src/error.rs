use thiserror::Error;

use tether_shared::ServerId;

/// Errors obtaining or decoding bearer tokens.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Transport-level failure talking to the auth API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The auth API refused the request.
    #[error("Token request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Neither a secret key nor an OAuth token is configured.
    #[error("No credentials configured for server {0}")]
    MissingCredentials(ServerId),

    /// The token is not a JWT with a readable `exp` claim.
    #[error("Malformed token: {0}")]
    MalformedToken(String),
}

/// Errors from the hub transport.
#[derive(Error, Debug)]
pub enum HubError {
    /// The websocket could not be established.
    #[error("Hub connection failed: {0}")]
    Connect(String),

    /// The upgrade request was answered with 401.
    #[error("Hub rejected the bearer token")]
    Unauthorized,

    /// The connection is gone; pending calls fail with this.
    #[error("Hub connection closed")]
    Closed,

    /// A frame could not be understood.
    #[error("Hub protocol error: {0}")]
    Protocol(String),

    /// The server reported an error for an invocation.
    #[error("Remote call {method} failed: {message}")]
    Remote { method: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by a `ServerSession`.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session is not in a state that accepts calls.
    #[error("Not connected to server {0}")]
    NotConnected(ServerId),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SessionError>;
