//! All server sessions, keyed by server identity.
//!
//! Sessions are created on first use from the server directory. Aggregate
//! queries scan the map on every call.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, warn};

use tether_net::{HubConnector, ServerSession, TokenRegistry};
use tether_shared::protocol::ServerInfo;
use tether_shared::{CharacterData, EventBus, ServerId, ServerState, UserData};

use crate::config::ServerDirectory;
use crate::distributor::SnapshotPusher;
use crate::error::{ClientError, Result};

/// Every server session, keyed by server identity.
pub struct SessionRegistry {
    /// Resolves identities to endpoints; unknown ids are errors.
    directory: ServerDirectory,
    /// One token provider per server, shared with the file transport.
    tokens: TokenRegistry,
    connector: Arc<dyn HubConnector>,
    bus: EventBus,
    /// Created on first reference, dropped by `disconnect_all`.
    sessions: DashMap<ServerId, ServerSession>,
}

impl SessionRegistry {
    pub fn new(
        directory: ServerDirectory,
        tokens: TokenRegistry,
        connector: Arc<dyn HubConnector>,
        bus: EventBus,
    ) -> Self {
        Self {
            directory,
            tokens,
            connector,
            bus,
            sessions: DashMap::new(),
        }
    }

    /// The session for `server`, created on first use.
    pub fn session(&self, server: ServerId) -> Result<ServerSession> {
        if let Some(session) = self.sessions.get(&server) {
            return Ok(session.clone());
        }
        let storage = self.directory.server(server)?;
        let tokens = self.tokens.provider(server)?;
        let session = self
            .sessions
            .entry(server)
            .or_insert_with(|| {
                debug!(server = %server, name = %storage.server_name, "Creating session");
                ServerSession::new(
                    storage.session_config(),
                    tokens,
                    self.connector.clone(),
                    self.bus.clone(),
                )
            })
            .clone();
        Ok(session)
    }

    /// The session for `server` if one was already created.
    pub fn existing(&self, server: ServerId) -> Option<ServerSession> {
        self.sessions.get(&server).map(|s| s.clone())
    }

    pub async fn create_connections(&self, server: ServerId) -> Result<()> {
        self.session(server)?.create_connections().await?;
        Ok(())
    }

    /// Tear down `server`'s connection. The session stays registered so
    /// its state remains visible and it can be reconnected.
    pub async fn pause(&self, server: ServerId) {
        if let Some(session) = self.existing(server) {
            session.pause_connection().await;
        }
    }

    /// Connect every server not marked fully paused, in parallel. One
    /// server failing never affects the others.
    pub async fn auto_connect(&self) -> Vec<(ServerId, Result<()>)> {
        let targets: Vec<ServerId> = self
            .directory
            .snapshot()
            .server_storage
            .iter()
            .filter(|s| !s.full_pause)
            .map(|s| s.server_id)
            .collect();
        info!(count = targets.len(), "Auto-connecting");

        let attempts = targets.into_iter().map(|server| async move {
            let outcome = self.create_connections(server).await;
            if let Err(e) = &outcome {
                warn!(server = %server, error = %e, "Auto-connect failed");
            }
            (server, outcome)
        });
        join_all(attempts).await
    }

    /// Pause every session, then drop them all.
    pub async fn disconnect_all(&self) {
        let servers: Vec<ServerId> = self.sessions.iter().map(|e| *e.key()).collect();
        join_all(servers.iter().map(|server| self.pause(*server))).await;
        for server in servers {
            self.sessions.remove(&server);
        }
    }

    // -- Aggregates ---------------------------------------------------------

    fn any_in(&self, states: &[ServerState]) -> bool {
        self.sessions.iter().any(|s| states.contains(&s.state()))
    }

    pub fn any_connected(&self) -> bool {
        self.any_in(&[ServerState::Connected])
    }

    pub fn any_connecting(&self) -> bool {
        self.any_in(&[ServerState::Connecting, ServerState::Reconnecting])
    }

    pub fn any_disconnecting(&self) -> bool {
        self.any_in(&[ServerState::Disconnecting])
    }

    pub fn connected_server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self
            .sessions
            .iter()
            .filter(|s| s.is_connected())
            .map(|s| *s.key())
            .collect();
        ids.sort();
        ids
    }

    /// Online users summed over connected servers.
    pub fn online_users(&self) -> u32 {
        self.sessions
            .iter()
            .filter(|s| s.is_connected())
            .map(|s| s.online_users())
            .sum()
    }

    // -- Per-server getters -------------------------------------------------

    pub fn state(&self, server: ServerId) -> ServerState {
        self.existing(server)
            .map(|s| s.state())
            .unwrap_or(ServerState::Disconnected)
    }

    pub fn uid(&self, server: ServerId) -> Option<String> {
        self.existing(server)?.uid()
    }

    pub fn display_name(&self, server: ServerId) -> Option<String> {
        self.existing(server)?.display_name()
    }

    pub fn server_info(&self, server: ServerId) -> Option<ServerInfo> {
        self.existing(server)?.server_info()
    }

    pub fn max_groups_created(&self, server: ServerId) -> Option<i32> {
        self.server_info(server).map(|i| i.max_groups_created_by_user)
    }

    pub fn max_groups_joined(&self, server: ServerId) -> Option<i32> {
        self.server_info(server).map(|i| i.max_groups_joined_by_user)
    }

    pub fn auth_failure(&self, server: ServerId) -> Option<String> {
        self.existing(server)?.auth_failure()
    }
}

#[async_trait]
impl SnapshotPusher for SessionRegistry {
    async fn push(
        &self,
        server: ServerId,
        data: &CharacterData,
        recipients: &[UserData],
    ) -> Result<()> {
        let session = self.existing(server).ok_or(ClientError::UnknownServer(server))?;
        session.push_character_data(data, recipients).await?;
        Ok(())
    }

    fn any_connected(&self) -> bool {
        SessionRegistry::any_connected(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use tether_net::{
        AuthError, HubConnection, HubError, HubEvent, StaticTokenSource, TokenSource,
        TokenSourceFactory,
    };
    use tether_shared::protocol::{ConnectionDto, SystemInfoDto};

    use crate::config::{ServerConfig, ServerStorage};

    pub(crate) struct TestFactory;

    impl TokenSourceFactory for TestFactory {
        fn source_for(
            &self,
            _server: ServerId,
        ) -> std::result::Result<Arc<dyn TokenSource>, AuthError> {
            Ok(Arc::new(StaticTokenSource("token".into())))
        }
    }

    pub(crate) struct TestConnection {
        pub calls: Mutex<Vec<(String, Vec<Value>)>>,
        pub events: mpsc::Sender<HubEvent>,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl HubConnection for TestConnection {
        async fn send(&self, method: &str, args: Vec<Value>) -> std::result::Result<(), HubError> {
            self.calls.lock().unwrap().push((method.to_string(), args));
            Ok(())
        }

        async fn invoke(
            &self,
            method: &str,
            args: Vec<Value>,
        ) -> std::result::Result<Value, HubError> {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(HubError::Closed);
            }
            self.calls.lock().unwrap().push((method.to_string(), args));
            if method == "GetConnectionDto" {
                return Ok(serde_json::to_value(ConnectionDto {
                    user: UserData::new("ME"),
                    ..Default::default()
                })
                .unwrap());
            }
            Ok(json!(null))
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Connector that refuses endpoints containing "down".
    #[derive(Default)]
    pub(crate) struct TestConnector {
        pub attempts: AtomicU32,
        pub connections: Mutex<Vec<(String, Arc<TestConnection>)>>,
    }

    impl TestConnector {
        pub fn connection_for(&self, endpoint_part: &str) -> Arc<TestConnection> {
            self.connections
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(e, _)| e.contains(endpoint_part))
                .map(|(_, c)| c.clone())
                .unwrap()
        }
    }

    #[async_trait]
    impl HubConnector for TestConnector {
        async fn connect(
            &self,
            endpoint: &str,
            _token: &str,
        ) -> std::result::Result<(Arc<dyn HubConnection>, mpsc::Receiver<HubEvent>), HubError>
        {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if endpoint.contains("down") {
                return Err(HubError::Unauthorized);
            }
            let (tx, rx) = mpsc::channel(16);
            let connection = Arc::new(TestConnection {
                calls: Mutex::new(Vec::new()),
                events: tx,
                stopped: AtomicBool::new(false),
            });
            self.connections
                .lock()
                .unwrap()
                .push((endpoint.to_string(), connection.clone()));
            Ok((connection, rx))
        }
    }

    pub(crate) fn registry_with(
        servers: Vec<ServerStorage>,
    ) -> (SessionRegistry, Arc<TestConnector>, EventBus) {
        let mut config = ServerConfig::default();
        for server in servers {
            config.add_server(server);
        }
        let connector = Arc::new(TestConnector::default());
        let bus = EventBus::new();
        let registry = SessionRegistry::new(
            ServerDirectory::new(config),
            TokenRegistry::new(Arc::new(TestFactory)),
            connector.clone(),
            bus.clone(),
        );
        (registry, connector, bus)
    }

    #[tokio::test]
    async fn test_unknown_server_is_an_error() {
        let (registry, _connector, _bus) = registry_with(vec![ServerStorage::new("A", "wss://a")]);
        let unknown = ServerId::new();
        assert!(matches!(
            registry.session(unknown),
            Err(ClientError::UnknownServer(id)) if id == unknown
        ));
    }

    #[tokio::test]
    async fn test_session_created_once() {
        let a = ServerStorage::new("A", "wss://a");
        let id = a.server_id;
        let (registry, _connector, _bus) = registry_with(vec![a]);
        assert!(registry.existing(id).is_none());
        let first = registry.session(id).unwrap();
        let second = registry.session(id).unwrap();
        assert_eq!(first.server(), second.server());
        assert_eq!(registry.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_auto_connect_isolates_failures() {
        let up = ServerStorage::new("Up", "wss://up");
        let down = ServerStorage::new("Down", "wss://down");
        let mut paused = ServerStorage::new("Paused", "wss://paused");
        paused.full_pause = true;
        let (up_id, down_id, paused_id) = (up.server_id, down.server_id, paused.server_id);
        let (registry, connector, _bus) = registry_with(vec![up, down, paused]);

        let outcomes = registry.auto_connect().await;
        assert_eq!(outcomes.len(), 2);
        for (server, outcome) in &outcomes {
            if *server == up_id {
                assert!(outcome.is_ok());
            } else {
                assert_eq!(*server, down_id);
                assert!(outcome.is_err());
            }
        }

        assert!(registry.any_connected());
        assert_eq!(registry.connected_server_ids(), vec![up_id]);
        assert_eq!(registry.state(paused_id), ServerState::Disconnected);
        assert!(registry.auth_failure(down_id).is_some());
        assert_eq!(registry.uid(up_id).as_deref(), Some("ME"));
        assert!(connector.attempts.load(Ordering::SeqCst) >= 2);

        registry.disconnect_all().await;
        assert!(!registry.any_connected());
        assert!(registry.existing(up_id).is_none());
    }

    #[tokio::test]
    async fn test_paused_session_stays_registered() {
        let a = ServerStorage::new("A", "wss://alpha");
        let a_id = a.server_id;
        let (registry, _connector, _bus) = registry_with(vec![a]);
        registry.create_connections(a_id).await.unwrap();
        assert!(registry.any_connected());

        registry.pause(a_id).await;
        assert!(registry.existing(a_id).is_some());
        assert_eq!(registry.state(a_id), ServerState::Disconnected);
        assert!(!registry.any_connected());

        registry.create_connections(a_id).await.unwrap();
        assert_eq!(registry.state(a_id), ServerState::Connected);
        assert_eq!(registry.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_online_users_summed_over_servers() {
        let a = ServerStorage::new("A", "wss://alpha");
        let b = ServerStorage::new("B", "wss://beta");
        let (a_id, b_id) = (a.server_id, b.server_id);
        let (registry, connector, _bus) = registry_with(vec![a, b]);
        registry.create_connections(a_id).await.unwrap();
        registry.create_connections(b_id).await.unwrap();

        for (part, users) in [("alpha", 5u32), ("beta", 7u32)] {
            connector
                .connection_for(part)
                .events
                .send(HubEvent::Message {
                    method: "Client_UpdateSystemInfo".into(),
                    args: vec![serde_json::to_value(SystemInfoDto { online_users: users }).unwrap()],
                })
                .await
                .unwrap();
        }
        for _ in 0..100 {
            if registry.online_users() == 12 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.online_users(), 12);
    }

    #[tokio::test]
    async fn test_push_routes_to_server_session() {
        let a = ServerStorage::new("A", "wss://alpha");
        let a_id = a.server_id;
        let (registry, connector, _bus) = registry_with(vec![a]);

        let data = CharacterData::from_content(Default::default()).unwrap();
        assert!(registry.push(a_id, &data, &[UserData::new("P1")]).await.is_err());

        registry.create_connections(a_id).await.unwrap();
        registry
            .push(a_id, &data, &[UserData::new("P1")])
            .await
            .unwrap();
        let calls = connector.connection_for("alpha").calls.lock().unwrap().clone();
        assert!(calls.iter().any(|(m, _)| m == "UserPushData"));
    }
}
