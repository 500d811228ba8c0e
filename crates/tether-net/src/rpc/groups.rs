use std::collections::BTreeMap;

use tether_shared::protocol::{
    BannedGroupUserDto, BulkPermissionsDto, GroupDto, GroupFullInfoDto, GroupJoinDto,
    GroupJoinInfoDto, GroupPairDto, GroupPairUserInfoDto, GroupPairUserPermissionDto,
    GroupPasswordDto, GroupPermissionDto,
};

use super::arg;
use crate::error::Result;
use crate::session::ServerSession;

impl ServerSession {
    pub async fn group_ban_user(&self, dto: &GroupPairDto, reason: &str) -> Result<()> {
        self.hub_send("GroupBanUser", vec![arg(dto)?, arg(reason)?])
            .await
    }

    pub async fn group_change_group_permission_state(&self, dto: &GroupPermissionDto) -> Result<()> {
        self.hub_send("GroupChangeGroupPermissionState", vec![arg(dto)?])
            .await
    }

    /// Per-user permission change inside a group, sent as a bulk update
    /// touching only that group.
    pub async fn group_change_individual_permission_state(
        &self,
        dto: &GroupPairUserPermissionDto,
    ) -> Result<()> {
        let bulk = BulkPermissionsDto {
            affected_users: BTreeMap::new(),
            affected_groups: BTreeMap::from([(dto.group.gid.clone(), dto.group_pair_permissions)]),
        };
        self.set_bulk_permissions(&bulk).await
    }

    pub async fn group_change_ownership(&self, dto: &GroupPairDto) -> Result<()> {
        self.hub_send("GroupChangeOwnership", vec![arg(dto)?])
            .await
    }

    pub async fn group_change_password(&self, dto: &GroupPasswordDto) -> Result<bool> {
        self.hub_invoke("GroupChangePassword", vec![arg(dto)?])
            .await
    }

    pub async fn group_clear(&self, dto: &GroupDto) -> Result<()> {
        self.hub_send("GroupClear", vec![arg(dto)?]).await
    }

    pub async fn group_create(&self) -> Result<GroupJoinDto> {
        self.hub_invoke("GroupCreate", Vec::new()).await
    }

    pub async fn group_create_temp_invite(&self, dto: &GroupDto, amount: u32) -> Result<Vec<String>> {
        self.hub_invoke("GroupCreateTempInvite", vec![arg(dto)?, arg(&amount)?])
            .await
    }

    pub async fn group_delete(&self, dto: &GroupDto) -> Result<()> {
        self.hub_send("GroupDelete", vec![arg(dto)?]).await
    }

    pub async fn group_get_banned_users(&self, dto: &GroupDto) -> Result<Vec<BannedGroupUserDto>> {
        self.hub_invoke("GroupGetBannedUsers", vec![arg(dto)?])
            .await
    }

    pub async fn group_join(&self, dto: &GroupPasswordDto) -> Result<GroupJoinInfoDto> {
        self.hub_invoke("GroupJoin", vec![arg(dto)?]).await
    }

    pub async fn group_join_finalize(&self, dto: &GroupJoinDto) -> Result<bool> {
        self.hub_invoke("GroupJoinFinalize", vec![arg(dto)?])
            .await
    }

    pub async fn group_leave(&self, dto: &GroupDto) -> Result<()> {
        self.hub_send("GroupLeave", vec![arg(dto)?]).await
    }

    pub async fn group_remove_user(&self, dto: &GroupPairDto) -> Result<()> {
        self.hub_send("GroupRemoveUser", vec![arg(dto)?]).await
    }

    pub async fn group_set_user_info(&self, dto: &GroupPairUserInfoDto) -> Result<()> {
        self.hub_send("GroupSetUserInfo", vec![arg(dto)?]).await
    }

    /// Number of members that were (or, with `execute = false`, would be)
    /// removed for inactivity.
    pub async fn group_prune(&self, dto: &GroupDto, days: u32, execute: bool) -> Result<u32> {
        self.hub_invoke("GroupPrune", vec![arg(dto)?, arg(&days)?, arg(&execute)?])
            .await
    }

    pub async fn groups_get_all(&self) -> Result<Vec<GroupFullInfoDto>> {
        self.hub_invoke("GroupsGetAll", Vec::new()).await
    }

    pub async fn group_unban_user(&self, dto: &GroupPairDto) -> Result<()> {
        self.hub_send("GroupUnbanUser", vec![arg(dto)?]).await
    }
}
