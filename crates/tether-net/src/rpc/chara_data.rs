use tether_shared::protocol::{
    CharaDataDownloadDto, CharaDataFullDto, CharaDataMetaInfoDto, CharaDataUpdateDto, PoseData,
    WorldData,
};
use tether_shared::UserData;

use super::arg;
use crate::error::Result;
use crate::session::ServerSession;

// Shared character data
impl ServerSession {
    pub async fn chara_data_create(&self) -> Result<Option<CharaDataFullDto>> {
        self.hub_invoke("CharaDataCreate", Vec::new()).await
    }

    pub async fn chara_data_update(&self, dto: &CharaDataUpdateDto) -> Result<Option<CharaDataFullDto>> {
        self.hub_invoke("CharaDataUpdate", vec![arg(dto)?]).await
    }

    pub async fn chara_data_delete(&self, id: &str) -> Result<bool> {
        self.hub_invoke("CharaDataDelete", vec![arg(id)?]).await
    }

    pub async fn chara_data_get_metainfo(&self, id: &str) -> Result<Option<CharaDataMetaInfoDto>> {
        self.hub_invoke("CharaDataGetMetainfo", vec![arg(id)?])
            .await
    }

    pub async fn chara_data_attempt_restore(&self, id: &str) -> Result<Option<CharaDataFullDto>> {
        self.hub_invoke("CharaDataAttemptRestore", vec![arg(id)?])
            .await
    }

    pub async fn chara_data_get_own(&self) -> Result<Vec<CharaDataFullDto>> {
        self.hub_invoke("CharaDataGetOwn", Vec::new()).await
    }

    pub async fn chara_data_get_shared(&self) -> Result<Vec<CharaDataMetaInfoDto>> {
        self.hub_invoke("CharaDataGetShared", Vec::new()).await
    }

    pub async fn chara_data_download(&self, id: &str) -> Result<Option<CharaDataDownloadDto>> {
        self.hub_invoke("CharaDataDownload", vec![arg(id)?]).await
    }
}

// GPose lobbies
impl ServerSession {
    /// Returns the new lobby id.
    pub async fn gpose_lobby_create(&self) -> Result<String> {
        self.hub_invoke("GposeLobbyCreate", Vec::new()).await
    }

    pub async fn gpose_lobby_leave(&self) -> Result<bool> {
        self.hub_invoke("GposeLobbyLeave", Vec::new()).await
    }

    /// Joins a lobby and returns its current members.
    pub async fn gpose_lobby_join(&self, lobby_id: &str) -> Result<Vec<UserData>> {
        self.hub_invoke("GposeLobbyJoin", vec![arg(lobby_id)?])
            .await
    }

    pub async fn gpose_lobby_push_character_data(&self, dto: &CharaDataDownloadDto) -> Result<()> {
        self.hub_send("GposeLobbyPushCharacterData", vec![arg(dto)?])
            .await
    }

    pub async fn gpose_lobby_push_pose_data(&self, pose: &PoseData) -> Result<()> {
        self.hub_send("GposeLobbyPushPoseData", vec![arg(pose)?])
            .await
    }

    pub async fn gpose_lobby_push_world_data(&self, world: &WorldData) -> Result<()> {
        self.hub_send("GposeLobbyPushWorldData", vec![arg(world)?])
            .await
    }
}
