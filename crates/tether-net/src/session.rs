//! One server's hub connection, its lifecycle state machine and the
//! reconnect supervisor.
//!
//! A session owns at most one live [`HubConnection`]. Replacing it always
//! stops the previous connection and its supervisor first. Typed RPC
//! methods live in [`crate::rpc`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_shared::constants::CONNECTION_LOST_NOTIFICATION_SECS;
use tether_shared::protocol::{ConnectionDto, ServerInfo, SystemInfoDto};
use tether_shared::{EventBus, ServerId, ServerState, Severity, SyncEvent};

use crate::auth::AuthTokenProvider;
use crate::error::{HubError, Result, SessionError};
use crate::hub::{HubConnection, HubConnector, HubEvent};
use crate::retry::RetrySchedule;

/// Hub method returning the handshake payload.
pub const GET_CONNECTION_DTO: &str = "GetConnectionDto";
/// Server callback carrying online-user statistics.
pub const CLIENT_UPDATE_SYSTEM_INFO: &str = "Client_UpdateSystemInfo";
/// Server callback announcing that a queued download can start.
pub const CLIENT_DOWNLOAD_READY: &str = "Client_DownloadReady";

/// What a session needs to know about its server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stable identity; never the server's position in a list.
    pub server: ServerId,
    /// Display name used in logs and notifications.
    pub name: String,
    /// Full hub endpoint (`wss://host/sync`).
    pub hub_uri: String,
}

#[derive(Default)]
struct SessionInner {
    state: ServerState,
    connection: Option<Arc<dyn HubConnection>>,
    connection_dto: Option<Arc<ConnectionDto>>,
    system_info: Option<SystemInfoDto>,
    auth_failure: Option<String>,
    retry: RetrySchedule,
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionShared {
    config: SessionConfig,
    tokens: Arc<AuthTokenProvider>,
    connector: Arc<dyn HubConnector>,
    bus: EventBus,
    inner: Mutex<SessionInner>,
    /// Serialises create/pause so two connections are never built at once.
    lifecycle: tokio::sync::Mutex<Option<Supervisor>>,
}

type Connected = (Arc<dyn HubConnection>, mpsc::Receiver<HubEvent>, ConnectionDto);

/// One server's hub connection, its state machine and its RPC surface.
/// Clones share the same session.
#[derive(Clone)]
pub struct ServerSession {
    shared: Arc<SessionShared>,
}

impl ServerSession {
    pub fn new(
        config: SessionConfig,
        tokens: Arc<AuthTokenProvider>,
        connector: Arc<dyn HubConnector>,
        bus: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                config,
                tokens,
                connector,
                bus,
                inner: Mutex::new(SessionInner::default()),
                lifecycle: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn server(&self) -> ServerId {
        self.shared.config.server
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn state(&self) -> ServerState {
        self.inner().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ServerState::Connected
    }

    pub fn connection_dto(&self) -> Option<Arc<ConnectionDto>> {
        self.inner().connection_dto.clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner()
            .connection_dto
            .as_ref()
            .map(|dto| dto.server_info.clone())
    }

    pub fn uid(&self) -> Option<String> {
        self.inner()
            .connection_dto
            .as_ref()
            .map(|dto| dto.user.uid.clone())
    }

    pub fn display_name(&self) -> Option<String> {
        self.inner()
            .connection_dto
            .as_ref()
            .map(|dto| dto.user.alias_or_uid().to_string())
    }

    pub fn system_info(&self) -> Option<SystemInfoDto> {
        self.inner().system_info.clone()
    }

    pub fn online_users(&self) -> u32 {
        self.inner()
            .system_info
            .as_ref()
            .map(|info| info.online_users)
            .unwrap_or(0)
    }

    /// Last authentication failure, cleared on a successful connect.
    pub fn auth_failure(&self) -> Option<String> {
        self.inner().auth_failure.clone()
    }

    /// Establish a fresh connection, disposing any previous one first.
    ///
    /// Authentication failures are returned. Transport failures leave the
    /// session in `Reconnecting` with the supervisor retrying in the
    /// background.
    pub async fn create_connections(&self) -> Result<()> {
        let mut supervisor = self.shared.lifecycle.lock().await;
        Self::stop_supervisor(supervisor.take()).await;
        self.dispose_connection().await;

        info!(server = %self.server(), name = %self.name(), "Connecting");
        self.set_state(ServerState::Connecting);

        let cancel = CancellationToken::new();
        let initial = match self.connect_once().await {
            Ok(connected) => Some(connected),
            Err(SessionError::Auth(e)) => {
                warn!(server = %self.server(), error = %e, "Authentication failed");
                self.record_auth_failure(e.to_string());
                return Err(SessionError::Auth(e));
            }
            Err(SessionError::Hub(HubError::Unauthorized)) => {
                warn!(server = %self.server(), "Hub rejected credentials");
                self.record_auth_failure(HubError::Unauthorized.to_string());
                return Err(SessionError::Hub(HubError::Unauthorized));
            }
            Err(e) => {
                warn!(server = %self.server(), error = %e, "Initial connect failed; retrying");
                self.set_state(ServerState::Reconnecting);
                None
            }
        };

        let events = match initial {
            Some((connection, events, dto)) => {
                self.install(connection, dto);
                Some(events)
            }
            None => None,
        };

        let task = tokio::spawn(self.clone().supervise(cancel.clone(), events));
        *supervisor = Some(Supervisor { cancel, task });
        Ok(())
    }

    /// Tear the connection down without reconnecting.
    pub async fn pause_connection(&self) {
        let mut supervisor = self.shared.lifecycle.lock().await;
        Self::stop_supervisor(supervisor.take()).await;

        let was = self.state();
        self.set_state(ServerState::Disconnecting);
        self.dispose_connection().await;
        {
            let mut inner = self.inner();
            inner.state = ServerState::Disconnected;
            inner.connection_dto = None;
            inner.system_info = None;
        }
        if was != ServerState::Disconnected {
            info!(server = %self.server(), "Connection paused");
            self.shared.bus.publish(SyncEvent::Disconnected {
                server: self.server(),
            });
        }
    }

    /// The live connection, if this session currently accepts calls.
    pub(crate) fn ensure_connected(&self) -> Result<Arc<dyn HubConnection>> {
        let inner = self.inner();
        if !inner.state.accepts_calls() {
            return Err(SessionError::NotConnected(self.server()));
        }
        inner
            .connection
            .clone()
            .ok_or(SessionError::NotConnected(self.server()))
    }

    pub(crate) async fn hub_send(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let connection = self.ensure_connected()?;
        debug!(server = %self.server(), method, "Hub send");
        connection.send(method, args).await?;
        Ok(())
    }

    pub(crate) async fn hub_invoke<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T> {
        let connection = self.ensure_connected()?;
        debug!(server = %self.server(), method, "Hub invoke");
        let value = connection.invoke(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ServerState) {
        let mut inner = self.inner();
        if inner.state != state {
            debug!(server = %self.server(), from = %inner.state, to = %state, "State change");
            inner.state = state;
        }
    }

    fn record_auth_failure(&self, message: String) {
        let mut inner = self.inner();
        inner.state = ServerState::Disconnected;
        inner.auth_failure = Some(message);
    }

    async fn stop_supervisor(supervisor: Option<Supervisor>) {
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            let _ = supervisor.task.await;
        }
    }

    /// Take the current connection out of the slot, then stop it.
    async fn dispose_connection(&self) {
        let old = self.inner().connection.take();
        if let Some(old) = old {
            old.stop().await;
        }
    }

    async fn connect_once(&self) -> Result<Connected> {
        let token = self.shared.tokens.get_or_update_token().await?;
        let endpoint = &self.shared.config.hub_uri;
        let (connection, events) = match self.shared.connector.connect(endpoint, &token).await {
            Err(HubError::Unauthorized) => {
                debug!(server = %self.server(), "Token rejected; refreshing");
                self.shared.tokens.invalidate();
                let token = self.shared.tokens.get_or_update_token().await?;
                self.shared.connector.connect(endpoint, &token).await?
            }
            other => other?,
        };

        let dto = match connection.invoke(GET_CONNECTION_DTO, Vec::new()).await {
            Ok(value) => serde_json::from_value::<ConnectionDto>(value),
            Err(e) => {
                connection.stop().await;
                return Err(e.into());
            }
        };
        match dto {
            Ok(dto) => Ok((connection, events, dto)),
            Err(e) => {
                connection.stop().await;
                Err(e.into())
            }
        }
    }

    fn install(&self, connection: Arc<dyn HubConnection>, dto: ConnectionDto) {
        let dto = Arc::new(dto);
        {
            let mut inner = self.inner();
            inner.connection = Some(connection);
            inner.connection_dto = Some(dto.clone());
            inner.auth_failure = None;
            inner.state = ServerState::Connected;
            inner.retry.reset();
        }
        info!(
            server = %self.server(),
            uid = %dto.user.uid,
            version = dto.server_version,
            "Connected"
        );
        self.shared.bus.publish(SyncEvent::Connected {
            server: self.server(),
            connection: dto,
        });
    }

    async fn supervise(self, cancel: CancellationToken, initial: Option<mpsc::Receiver<HubEvent>>) {
        let mut events = initial;
        loop {
            if let Some(mut rx) = events.take() {
                let reason = tokio::select! {
                    _ = cancel.cancelled() => return,
                    reason = self.pump(&mut rx) => reason,
                };
                warn!(server = %self.server(), reason = ?reason, "Hub connection lost");
                self.set_state(ServerState::Reconnecting);
                self.dispose_connection().await;
            }

            match self.reconnect(&cancel).await {
                Some(rx) => events = Some(rx),
                None => return,
            }
        }
    }

    /// Forward hub callbacks until the connection closes.
    async fn pump(&self, events: &mut mpsc::Receiver<HubEvent>) -> Option<String> {
        loop {
            match events.recv().await {
                Some(HubEvent::Message { method, args }) => self.dispatch(method, args),
                Some(HubEvent::Closed(reason)) => return reason,
                None => return None,
            }
        }
    }

    fn dispatch(&self, method: String, args: Vec<Value>) {
        match method.as_str() {
            CLIENT_UPDATE_SYSTEM_INFO => {
                match args.into_iter().next().map(serde_json::from_value::<SystemInfoDto>) {
                    Some(Ok(info)) => self.inner().system_info = Some(info),
                    _ => warn!(server = %self.server(), "Malformed system info"),
                }
            }
            CLIENT_DOWNLOAD_READY => match args.first().and_then(Value::as_str) {
                Some(id) => self.shared.bus.publish(SyncEvent::DownloadReady {
                    request_id: id.to_string(),
                }),
                None => warn!(server = %self.server(), "Malformed download-ready callback"),
            },
            _ => self.shared.bus.publish(SyncEvent::HubMessage {
                server: self.server(),
                method,
                payload: args,
            }),
        }
    }

    /// Retry forever. Returns `None` only when cancelled.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<mpsc::Receiver<HubEvent>> {
        let mut attempt: u32 = 0;
        loop {
            let step = self.inner().retry.next_step(attempt);
            if step.announce {
                self.announce_lost();
            }
            debug!(server = %self.server(), attempt, delay = ?step.delay, "Reconnecting");

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(step.delay) => {}
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return None,
                outcome = self.connect_once() => outcome,
            };
            match outcome {
                Ok((connection, events, dto)) => {
                    if cancel.is_cancelled() {
                        connection.stop().await;
                        return None;
                    }
                    self.install(connection, dto);
                    return Some(events);
                }
                Err(e) => {
                    warn!(server = %self.server(), attempt, error = %e, "Reconnect failed");
                    if let SessionError::Auth(auth) = &e {
                        self.inner().auth_failure = Some(auth.to_string());
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn announce_lost(&self) {
        let server = self.server();
        warn!(server = %server, "Connection lost; still retrying");
        self.shared.bus.publish(SyncEvent::notification(
            "Connection lost",
            format!("Connection to {} lost. Reconnecting.", self.name()),
            Severity::Warning,
            Duration::from_secs(CONNECTION_LOST_NOTIFICATION_SECS),
        ));
        self.shared.bus.publish(SyncEvent::Disconnected { server });
    }
}
