use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a configured backend server.
///
/// Assigned once when the server entry is created and persisted with it.
/// Never derived from the entry's position in the server list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ServerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A remote user as known by one server: UID plus an optional vanity alias.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl UserData {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            alias: None,
        }
    }

    pub fn with_alias(uid: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn alias_or_uid(&self) -> &str {
        match self.alias.as_deref() {
            Some(alias) if !alias.is_empty() => alias,
            _ => &self.uid,
        }
    }
}

/// A syncshell (group) as known by one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct GroupData {
    pub gid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl GroupData {
    pub fn new(gid: impl Into<String>) -> Self {
        Self {
            gid: gid.into(),
            alias: None,
        }
    }

    pub fn alias_or_gid(&self) -> &str {
        match self.alias.as_deref() {
            Some(alias) if !alias.is_empty() => alias,
            _ => &self.gid,
        }
    }
}

/// "This user, on this server".
///
/// Equality and hashing look only at the UID and the server; the alias is
/// display data and may differ between two keys that name the same peer.
#[derive(Debug, Clone)]
pub struct ServerUserKey {
    pub user: UserData,
    pub server: ServerId,
}

impl ServerUserKey {
    pub fn new(user: UserData, server: ServerId) -> Self {
        Self { user, server }
    }
}

impl PartialEq for ServerUserKey {
    fn eq(&self, other: &Self) -> bool {
        self.user.uid == other.user.uid && self.server == other.server
    }
}

impl Eq for ServerUserKey {}

impl Hash for ServerUserKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.user.uid.hash(state);
        self.server.hash(state);
    }
}

/// "This group, on this server". Same equality rules as [`ServerUserKey`].
#[derive(Debug, Clone)]
pub struct ServerGroupKey {
    pub group: GroupData,
    pub server: ServerId,
}

impl ServerGroupKey {
    pub fn new(group: GroupData, server: ServerId) -> Self {
        Self { group, server }
    }
}

impl PartialEq for ServerGroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.group.gid == other.group.gid && self.server == other.server
    }
}

impl Eq for ServerGroupKey {}

impl Hash for ServerGroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.gid.hash(state);
        self.server.hash(state);
    }
}

/// Lifecycle of one server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServerState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl ServerState {
    /// States in which RPC calls are accepted.
    pub fn accepts_calls(self) -> bool {
        matches!(
            self,
            ServerState::Connected | ServerState::Connecting | ServerState::Reconnecting
        )
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Disconnected => "disconnected",
            ServerState::Connecting => "connecting",
            ServerState::Connected => "connected",
            ServerState::Reconnecting => "reconnecting",
            ServerState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}
