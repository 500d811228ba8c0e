// Hub connectivity: auth tokens, reconnect policy, sessions and typed RPC.

pub mod auth;
pub mod error;
pub mod hub;
pub mod retry;
pub mod rpc;
pub mod session;

pub use auth::{
    AuthTokenProvider, Credentials, HttpTokenSource, StaticTokenSource, TokenRegistry,
    TokenSource, TokenSourceFactory,
};
pub use error::{AuthError, HubError, Result, SessionError};
pub use hub::{HubConnection, HubConnector, HubEvent, HubFrame, WsHubConnector};
pub use retry::{RetrySchedule, RetryStep};
pub use session::{ServerSession, SessionConfig};
