use tether_shared::protocol::{
    BulkPermissionsDto, DefaultPermissionsDto, UserCharaDataMessageDto, UserDto,
    UserPermissionsDto, UserProfileDto,
};
use tether_shared::{CharacterData, UserData};

use super::arg;
use crate::error::Result;
use crate::session::ServerSession;

impl ServerSession {
    /// Push a snapshot to every listed recipient in one call.
    pub async fn push_character_data(
        &self,
        data: &CharacterData,
        recipients: &[UserData],
    ) -> Result<()> {
        let message = UserCharaDataMessageDto {
            recipients: recipients.to_vec(),
            chara_data: data.clone(),
        };
        tracing::info!(
            server = %self.server(),
            hash = %data.data_hash(),
            recipients = recipients.len(),
            "Pushing character data"
        );
        self.hub_invoke::<serde_json::Value>("UserPushData", vec![arg(&message)?])
            .await
            .map(|_| ())
    }

    pub async fn user_add_pair(&self, dto: &UserDto) -> Result<()> {
        self.hub_send("UserAddPair", vec![arg(dto)?]).await
    }

    /// Convenience for pairing by UID alone.
    pub async fn user_add_pair_by_uid(&self, uid: &str) -> Result<()> {
        self.user_add_pair(&UserDto::new(UserData::new(uid))).await
    }

    pub async fn user_delete(&self) -> Result<()> {
        self.hub_send("UserDelete", Vec::new()).await
    }

    pub async fn user_get_profile(&self, dto: &UserDto) -> Result<UserProfileDto> {
        self.hub_invoke("UserGetProfile", vec![arg(dto)?]).await
    }

    pub async fn user_set_profile(&self, dto: &UserProfileDto) -> Result<()> {
        self.hub_send("UserSetProfile", vec![arg(dto)?]).await
    }

    pub async fn set_bulk_permissions(&self, dto: &BulkPermissionsDto) -> Result<()> {
        self.hub_send("SetBulkPermissions", vec![arg(dto)?]).await
    }

    pub async fn user_remove_pair(&self, dto: &UserDto) -> Result<()> {
        self.hub_send("UserRemovePair", vec![arg(dto)?]).await
    }

    pub async fn user_set_pair_permissions(&self, dto: &UserPermissionsDto) -> Result<()> {
        self.hub_send("UserSetPairPermissions", vec![arg(dto)?])
            .await
    }

    pub async fn user_update_default_permissions(&self, dto: &DefaultPermissionsDto) -> Result<()> {
        self.hub_send("UserUpdateDefaultPermissions", vec![arg(dto)?])
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tether_shared::{CharacterContent, EventBus};

    use super::*;
    use crate::session::tests::{session_with, FakeConnector};

    #[tokio::test]
    async fn test_push_uses_wire_name_and_batches_recipients() {
        let connector = Arc::new(FakeConnector::default());
        let session = session_with(connector.clone(), EventBus::new());
        session.create_connections().await.unwrap();

        let data = CharacterData::from_content(CharacterContent::default()).unwrap();
        let recipients = vec![UserData::new("P1"), UserData::new("P2")];
        session.push_character_data(&data, &recipients).await.unwrap();

        let calls = connector.last().calls.lock().unwrap().clone();
        let (method, args) = calls.last().unwrap();
        assert_eq!(method, "UserPushData");
        assert_eq!(args.len(), 1);
        assert_eq!(args[0]["recipients"].as_array().unwrap().len(), 2);
        assert_eq!(args[0]["charaData"]["dataHash"], data.data_hash().0);
    }

    #[tokio::test]
    async fn test_add_pair_by_uid() {
        let connector = Arc::new(FakeConnector::default());
        let session = session_with(connector.clone(), EventBus::new());
        session.create_connections().await.unwrap();
        session.user_add_pair_by_uid("FRIEND").await.unwrap();
        let calls = connector.last().calls.lock().unwrap().clone();
        assert_eq!(calls.last().unwrap().0, "UserAddPair");
        assert_eq!(calls.last().unwrap().1[0]["user"]["uid"], "FRIEND");
    }
}
