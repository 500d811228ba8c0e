//! Typed RPC surface of a [`ServerSession`](crate::session::ServerSession).
//!
//! Every method requires the session to accept calls (see
//! [`ServerState::accepts_calls`](tether_shared::ServerState::accepts_calls))
//! and fails with `NotConnected` otherwise. Nothing is queued.

mod chara_data;
mod groups;
mod users;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

pub(crate) fn arg<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
