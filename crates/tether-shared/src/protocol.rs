//! Wire DTOs exchanged with a sync server, over HTTP (file endpoints) and
//! over the hub channel (RPC arguments and results).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::CharacterData;
use crate::types::{GroupData, UserData};

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

/// Batch existence check: which of these hashes does the server need?
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilesSendDto {
    pub file_hashes: Vec<String>,
    /// UIDs of the peers the data is meant for; servers may use them for
    /// access-control decisions.
    #[serde(rename = "UIDs")]
    pub uids: Vec<String>,
}

/// Server answer for one hash of a [`FilesSendDto`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileDto {
    pub hash: String,
    #[serde(default)]
    pub is_forbidden: bool,
    #[serde(default)]
    pub forbidden_by: String,
}

/// Server answer describing a downloadable file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFileDto {
    pub hash: String,
    #[serde(default)]
    pub file_exists: bool,
    #[serde(default)]
    pub is_forbidden: bool,
    #[serde(default)]
    pub forbidden_by: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub raw_size: u64,
    #[serde(default)]
    pub url: String,
}

// ---------------------------------------------------------------------------
// Connection handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub short_server_name: String,
    /// Base URI of the server's file host (CDN).
    pub file_server_address: String,
    pub max_groups_created_by_user: i32,
    pub max_groups_joined_by_user: i32,
    pub max_group_user_count: i32,
}

/// Per-pair permission switches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissions {
    pub paused: bool,
    /// "Preferred" permissions: the pair survives group changes and is
    /// exempt from performance auto-pause unless configured otherwise.
    pub sticky: bool,
    pub disable_animations: bool,
    pub disable_sounds: bool,
    pub disable_vfx: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroupPermissions {
    pub disable_invites: bool,
    pub prefer_disable_animations: bool,
    pub prefer_disable_sounds: bool,
    pub prefer_disable_vfx: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DefaultPermissionsDto {
    pub disable_individual_animations: bool,
    pub disable_individual_sounds: bool,
    pub disable_individual_vfx: bool,
    pub disable_group_animations: bool,
    pub disable_group_sounds: bool,
    pub disable_group_vfx: bool,
    pub individual_is_sticky: bool,
}

/// Returned by the server right after the hub connection is established.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDto {
    pub user: UserData,
    pub server_version: i32,
    pub server_info: ServerInfo,
    #[serde(default)]
    pub default_preferred_permissions: DefaultPermissionsDto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfoDto {
    pub online_users: u32,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub user: UserData,
}

impl UserDto {
    pub fn new(user: UserData) -> Self {
        Self { user }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionsDto {
    pub user: UserData,
    pub permissions: UserPermissions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BulkPermissionsDto {
    /// Keyed by user UID.
    pub affected_users: BTreeMap<String, UserPermissions>,
    /// Keyed by group GID.
    pub affected_groups: BTreeMap<String, UserPermissions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileDto {
    pub user: UserData,
    pub disabled: bool,
    pub is_nsfw: Option<bool>,
    pub profile_picture_base64: Option<String>,
    pub description: Option<String>,
}

/// Character data pushed to a list of recipients in one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCharaDataMessageDto {
    pub recipients: Vec<UserData>,
    pub chara_data: CharacterData,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupDto {
    pub group: GroupData,
}

impl GroupDto {
    pub fn new(group: GroupData) -> Self {
        Self { group }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupPairDto {
    pub group: GroupData,
    pub user: UserData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupPasswordDto {
    pub group: GroupData,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupJoinDto {
    pub group: GroupData,
    pub password: String,
    pub group_user_preferred_permissions: UserPermissions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupJoinInfoDto {
    pub group: GroupData,
    pub owner: UserData,
    pub group_permissions: GroupPermissions,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupPermissionDto {
    pub group: GroupData,
    pub permissions: GroupPermissions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupPairUserPermissionDto {
    pub group: GroupData,
    pub user: UserData,
    pub group_pair_permissions: UserPermissions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroupPairUserInfo {
    pub is_moderator: bool,
    pub is_pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupPairUserInfoDto {
    pub group: GroupData,
    pub user: UserData,
    pub group_user_info: GroupPairUserInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BannedGroupUserDto {
    pub group: GroupData,
    pub user: UserData,
    pub reason: String,
    pub banned_on: DateTime<Utc>,
    pub banned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupFullInfoDto {
    pub group: GroupData,
    pub owner: UserData,
    pub group_permissions: GroupPermissions,
    pub group_user_permissions: UserPermissions,
    pub group_user_info: GroupPairUserInfo,
    #[serde(default)]
    pub group_pair_user_infos: BTreeMap<String, GroupPairUserInfo>,
}

// ---------------------------------------------------------------------------
// Shared character data and GPose lobbies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessType {
    #[default]
    Individuals,
    ClosePairs,
    AllPairs,
    Public,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ShareType {
    #[default]
    Private,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CharaDataMetaInfoDto {
    pub id: String,
    pub uploader: UserData,
    pub description: String,
    pub updated_date: DateTime<Utc>,
    pub can_be_downloaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CharaDataFullDto {
    pub id: String,
    pub uploader: UserData,
    pub description: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub access_type: AccessType,
    pub share_type: ShareType,
    pub glamourer_data: String,
    pub customize_data: String,
    pub manipulation_data: String,
    #[serde(default)]
    pub file_gamepaths: Vec<GamePathEntry>,
    #[serde(default)]
    pub file_swaps: Vec<GamePathEntry>,
    #[serde(default)]
    pub allowed_users: Vec<UserData>,
    #[serde(default)]
    pub allowed_groups: Vec<GroupData>,
    pub download_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GamePathEntry {
    pub hash_or_file_swap: String,
    pub game_path: String,
}

/// Partial update; `None` fields are left unchanged by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CharaDataUpdateDto {
    pub id: String,
    pub description: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub access_type: Option<AccessType>,
    pub share_type: Option<ShareType>,
    pub glamourer_data: Option<String>,
    pub customize_data: Option<String>,
    pub manipulation_data: Option<String>,
    pub file_gamepaths: Option<Vec<GamePathEntry>>,
    pub file_swaps: Option<Vec<GamePathEntry>>,
    pub allowed_users: Option<Vec<String>>,
    pub allowed_groups: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CharaDataDownloadDto {
    pub id: String,
    pub uploader: UserData,
    pub glamourer_data: String,
    pub customize_data: String,
    pub manipulation_data: String,
    #[serde(default)]
    pub file_gamepaths: Vec<GamePathEntry>,
    #[serde(default)]
    pub file_swaps: Vec<GamePathEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoseData {
    pub is_delta: bool,
    #[serde(default)]
    pub bones: BTreeMap<String, Transform>,
    #[serde(default)]
    pub main_hand: BTreeMap<String, Transform>,
    #[serde(default)]
    pub off_hand: BTreeMap<String, Transform>,
    pub model_difference: Transform,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorldData {
    pub location: [f32; 3],
    pub rotation: [f32; 4],
    pub server_id: u32,
    pub territory_id: u32,
    pub map_id: u32,
}
