// Types, wire formats and the event bus shared by every tether crate.

pub mod constants;
pub mod data;
pub mod error;
pub mod events;
pub mod munge;
pub mod protocol;
pub mod routes;
pub mod types;

pub use data::{CharacterContent, CharacterData, DataHash, FileReplacement, ObjectKind};
pub use error::SharedError;
pub use events::{EventBus, Severity, Subscription, SyncEvent};
pub use types::{GroupData, ServerGroupKey, ServerId, ServerState, ServerUserKey, UserData};
