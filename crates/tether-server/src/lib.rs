//! # tether-server
//!
//! Reference file host for the tether sync client. Implements the HTTP
//! file surface clients upload to: batched existence checks, plain and
//! munged uploads, and bulk deletion.

pub mod api;
pub mod config;
pub mod error;
pub mod file_store;
pub mod rate_limit;

pub use api::{build_router, serve, AppState, Stats};
pub use config::ServerConfig;
pub use error::ServerError;
pub use file_store::FileStore;
pub use rate_limit::RateLimiter;
