//! Outbound HTTP to file hosts plus the global download slot pool.
//!
//! One orchestrator serves every configured server. Per-server state (CDN
//! base URI, bearer token) is keyed by [`ServerId`]. The download slot pool
//! is global: it bounds downloads across all servers together.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_net::TokenRegistry;
use tether_shared::constants::{APP_NAME, DEFAULT_PARALLEL_DOWNLOADS};
use tether_shared::{EventBus, ServerId, SyncEvent};

use crate::error::{Result, TransferError};
use crate::transfer::{FileTransfer, UploadFileTransfer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpeedUnit {
    #[default]
    Bps,
    KBps,
    MBps,
}

impl SpeedUnit {
    pub fn multiplier(self) -> i64 {
        match self {
            SpeedUnit::Bps => 1,
            SpeedUnit::KBps => 1024,
            SpeedUnit::MBps => 1024 * 1024,
        }
    }
}

/// Live transfer settings, observed through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    pub parallel_downloads: usize,
    /// Aggregate download cap in `speed_unit`; 0 or less means unlimited.
    pub download_speed_limit: i64,
    pub speed_unit: SpeedUnit,
    /// Upload munged from the start instead of as a fallback.
    pub use_alternative_upload: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            parallel_downloads: DEFAULT_PARALLEL_DOWNLOADS,
            download_speed_limit: 0,
            speed_unit: SpeedUnit::Bps,
            use_alternative_upload: false,
        }
    }
}

/// Request payloads.
pub enum RequestBody {
    Empty,
    Json(Value),
    /// `application/octet-stream` body of known length.
    Stream { body: reqwest::Body, length: u64 },
    Bytes(Bytes),
}

struct SlotPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl SlotPool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }
}

/// Outbound HTTP for every server: bearer injection, CDN URIs, the
/// forbidden list and the global download slot pool.
pub struct TransferOrchestrator {
    /// Shared client carrying the `tether/<version>` user agent.
    http: reqwest::Client,
    tokens: TokenRegistry,
    bus: EventBus,
    /// Live settings from the client config.
    settings: watch::Receiver<TransferSettings>,
    /// Learned from each connection handshake, cleared on disconnect.
    cdn_uris: DashMap<ServerId, String>,
    /// Request id -> whether the server announced it ready.
    download_ready: DashMap<String, bool>,
    /// Keyed by lowercased hash.
    forbidden: DashMap<String, UploadFileTransfer>,
    slots: Mutex<SlotPool>,
}

impl TransferOrchestrator {
    pub fn new(
        tokens: TokenRegistry,
        bus: EventBus,
        settings: watch::Receiver<TransferSettings>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")))
            .build()?;
        let capacity = settings.borrow().parallel_downloads.max(1);
        Ok(Self {
            http,
            tokens,
            bus,
            settings,
            cdn_uris: DashMap::new(),
            download_ready: DashMap::new(),
            forbidden: DashMap::new(),
            slots: Mutex::new(SlotPool::new(capacity)),
        })
    }

    pub fn settings(&self) -> TransferSettings {
        self.settings.borrow().clone()
    }

    // -- CDN URIs ----------------------------------------------------------

    pub fn set_cdn_uri(&self, server: ServerId, uri: impl Into<String>) {
        self.cdn_uris.insert(server, uri.into());
    }

    pub fn clear_cdn_uri(&self, server: ServerId) {
        self.cdn_uris.remove(&server);
    }

    pub fn cdn_uri(&self, server: ServerId) -> Option<String> {
        self.cdn_uris.get(&server).map(|u| u.clone())
    }

    /// The server's file host, or `NotInitialized` before its handshake.
    pub fn require_cdn_uri(&self, server: ServerId) -> Result<String> {
        self.cdn_uri(server)
            .ok_or(TransferError::NotInitialized(server))
    }

    // -- Download-ready flags ---------------------------------------------

    pub fn is_download_ready(&self, request_id: &str) -> bool {
        self.download_ready
            .get(request_id)
            .map(|ready| *ready)
            .unwrap_or(false)
    }

    pub fn clear_download_request(&self, request_id: &str) {
        self.download_ready.remove(request_id);
    }

    // -- Forbidden transfers ----------------------------------------------

    /// Record a policy rejection. The first record for a hash wins.
    pub fn add_forbidden(&self, transfer: UploadFileTransfer) {
        let key = transfer.hash().to_ascii_lowercase();
        self.forbidden.entry(key).or_insert(transfer);
    }

    pub fn is_forbidden(&self, hash: &str) -> bool {
        self.forbidden.contains_key(&hash.to_ascii_lowercase())
    }

    pub fn forbidden_transfers(&self) -> Vec<UploadFileTransfer> {
        self.forbidden.iter().map(|e| e.value().clone()).collect()
    }

    pub fn forbidden_hashes(&self) -> std::collections::HashSet<String> {
        self.forbidden
            .iter()
            .map(|e| e.value().hash().to_string())
            .collect()
    }

    // -- HTTP ---------------------------------------------------------------

    /// Send an authenticated request to one of `server`'s endpoints.
    ///
    /// Uses the cached bearer token when there is one. Transport errors are
    /// returned as-is; retrying is the caller's business.
    pub async fn send_request(
        &self,
        server: ServerId,
        method: Method,
        uri: &str,
        body: RequestBody,
        cancel: Option<&CancellationToken>,
    ) -> Result<reqwest::Response> {
        let token = match self.tokens.cached_token(server) {
            Some(token) => token,
            None => self.tokens.get_or_update_token(server).await?,
        };

        let mut request = self.http.request(method.clone(), uri).bearer_auth(token);
        request = match body {
            RequestBody::Empty => {
                debug!(method = %method, uri, "Sending request");
                request
            }
            RequestBody::Json(value) => {
                debug!(method = %method, uri, content = %value, "Sending request");
                request.json(&value)
            }
            RequestBody::Stream { body, length } => {
                debug!(method = %method, uri, length, "Sending stream");
                request
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, length)
                    .body(body)
            }
            RequestBody::Bytes(bytes) => {
                debug!(method = %method, uri, length = bytes.len(), "Sending bytes");
                request
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(bytes)
            }
        };

        let outcome = match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                outcome = request.send() => outcome,
            },
            None => request.send().await,
        };
        outcome.map_err(|e| {
            warn!(uri, error = %e, "Request failed");
            TransferError::Http(e)
        })
    }

    // -- Download slots ---------------------------------------------------

    fn pool(&self) -> MutexGuard<'_, SlotPool> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a free download slot. Pair with
    /// [`release_download_slot`](Self::release_download_slot).
    ///
    /// A changed "parallel downloads" setting takes effect here, and only
    /// while no slot is held.
    pub async fn wait_for_download_slot(&self, cancel: &CancellationToken) -> Result<()> {
        let semaphore = {
            let mut pool = self.pool();
            let configured = self.settings.borrow().parallel_downloads.max(1);
            if configured != pool.capacity && pool.in_use() == 0 {
                debug!(from = pool.capacity, to = configured, "Resizing download slot pool");
                *pool = SlotPool::new(configured);
            }
            pool.semaphore.clone()
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            permit = semaphore.acquire_owned() => permit.map_err(|_| TransferError::Cancelled)?,
        };
        // Released explicitly through `release_download_slot`.
        permit.forget();
        self.bus.publish(SyncEvent::DownloadLimitChanged);
        Ok(())
    }

    /// Give a slot back. Releasing more than was taken is ignored.
    pub fn release_download_slot(&self) {
        let pool = self.pool();
        if pool.semaphore.available_permits() >= pool.capacity {
            return;
        }
        pool.semaphore.add_permits(1);
        drop(pool);
        self.bus.publish(SyncEvent::DownloadLimitChanged);
    }

    pub fn download_slots_in_use(&self) -> usize {
        self.pool().in_use()
    }

    pub fn download_slot_capacity(&self) -> usize {
        self.pool().capacity
    }

    /// Per-slot share of the download cap in bytes per second. `0` means
    /// unlimited.
    pub fn download_limit_per_slot(&self) -> i64 {
        let (limit, unit) = {
            let settings = self.settings.borrow();
            (settings.download_speed_limit, settings.speed_unit)
        };
        if limit <= 0 {
            return 0;
        }
        let limit = limit.saturating_mul(unit.multiplier());
        let in_use = self.download_slots_in_use().max(1) as i64;
        let divided = limit / in_use;
        if divided < 0 {
            warn!(divided, in_use, limit, "Negative bandwidth share; treating as unlimited");
            return i64::MAX;
        }
        divided.max(1)
    }

    // -- Events -------------------------------------------------------------

    pub fn handle_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Connected { server, connection } => {
                self.set_cdn_uri(*server, connection.server_info.file_server_address.clone());
            }
            SyncEvent::Disconnected { server } => self.clear_cdn_uri(*server),
            SyncEvent::DownloadReady { request_id } => {
                self.download_ready.insert(request_id.clone(), true);
            }
            _ => {}
        }
    }

    /// Follow the bus until `cancel` fires.
    pub fn spawn_event_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.bus.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => this.handle_event(&event),
                        None => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use tether_net::{AuthError, StaticTokenSource, TokenSource, TokenSourceFactory};
    use tether_shared::protocol::{ConnectionDto, ServerInfo, UploadFileDto};

    pub(crate) struct StaticFactory;

    impl TokenSourceFactory for StaticFactory {
        fn source_for(&self, _server: ServerId) -> std::result::Result<Arc<dyn TokenSource>, AuthError> {
            Ok(Arc::new(StaticTokenSource("secret".into())))
        }
    }

    pub(crate) fn orchestrator_with(
        settings: TransferSettings,
    ) -> (Arc<TransferOrchestrator>, watch::Sender<TransferSettings>, EventBus) {
        let (tx, rx) = watch::channel(settings);
        let bus = EventBus::new();
        let tokens = TokenRegistry::new(Arc::new(StaticFactory));
        let orchestrator = TransferOrchestrator::new(tokens, bus.clone(), rx).unwrap();
        (Arc::new(orchestrator), tx, bus)
    }

    fn limited(limit: i64, unit: SpeedUnit, slots: usize) -> TransferSettings {
        TransferSettings {
            parallel_downloads: slots,
            download_speed_limit: limit,
            speed_unit: unit,
            use_alternative_upload: false,
        }
    }

    #[tokio::test]
    async fn test_limit_per_slot_divides_by_active_slots() {
        let (orch, _tx, _bus) = orchestrator_with(limited(1000, SpeedUnit::Bps, 10));
        let cancel = CancellationToken::new();
        assert_eq!(orch.download_limit_per_slot(), 1000);
        for _ in 0..4 {
            orch.wait_for_download_slot(&cancel).await.unwrap();
        }
        assert_eq!(orch.download_limit_per_slot(), 250);
    }

    #[test]
    fn test_limit_unlimited_and_units() {
        let (orch, tx, _bus) = orchestrator_with(limited(0, SpeedUnit::Bps, 4));
        assert_eq!(orch.download_limit_per_slot(), 0);
        tx.send_replace(limited(-5, SpeedUnit::MBps, 4));
        assert_eq!(orch.download_limit_per_slot(), 0);
        tx.send_replace(limited(2, SpeedUnit::KBps, 4));
        assert_eq!(orch.download_limit_per_slot(), 2048);
        tx.send_replace(limited(1, SpeedUnit::MBps, 4));
        assert_eq!(orch.download_limit_per_slot(), 1024 * 1024);
    }

    #[tokio::test]
    async fn test_limit_clamps_to_one_byte() {
        let (orch, _tx, _bus) = orchestrator_with(limited(1, SpeedUnit::Bps, 4));
        let cancel = CancellationToken::new();
        orch.wait_for_download_slot(&cancel).await.unwrap();
        orch.wait_for_download_slot(&cancel).await.unwrap();
        assert_eq!(orch.download_limit_per_slot(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_bound_concurrent_holders() {
        let (orch, _tx, _bus) = orchestrator_with(limited(0, SpeedUnit::Bps, 2));
        let cancel = CancellationToken::new();
        orch.wait_for_download_slot(&cancel).await.unwrap();
        orch.wait_for_download_slot(&cancel).await.unwrap();
        assert_eq!(orch.download_slots_in_use(), 2);

        let third = tokio::time::timeout(Duration::from_secs(5), orch.wait_for_download_slot(&cancel)).await;
        assert!(third.is_err(), "third holder admitted");

        orch.release_download_slot();
        orch.wait_for_download_slot(&cancel).await.unwrap();
        assert_eq!(orch.download_slots_in_use(), 2);
    }

    #[tokio::test]
    async fn test_resize_waits_until_idle() {
        let (orch, tx, _bus) = orchestrator_with(limited(0, SpeedUnit::Bps, 2));
        let cancel = CancellationToken::new();
        orch.wait_for_download_slot(&cancel).await.unwrap();

        tx.send_replace(limited(0, SpeedUnit::Bps, 5));
        orch.wait_for_download_slot(&cancel).await.unwrap();
        assert_eq!(orch.download_slot_capacity(), 2);
        assert_eq!(orch.download_slots_in_use(), 2);

        orch.release_download_slot();
        orch.release_download_slot();
        assert_eq!(orch.download_slots_in_use(), 0);

        orch.wait_for_download_slot(&cancel).await.unwrap();
        assert_eq!(orch.download_slot_capacity(), 5);
        assert_eq!(orch.download_slots_in_use(), 1);
    }

    #[tokio::test]
    async fn test_over_release_is_ignored() {
        let (orch, _tx, _bus) = orchestrator_with(limited(0, SpeedUnit::Bps, 2));
        orch.release_download_slot();
        orch.release_download_slot();
        assert_eq!(orch.download_slots_in_use(), 0);
        assert_eq!(orch.pool().semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let (orch, _tx, _bus) = orchestrator_with(limited(0, SpeedUnit::Bps, 1));
        let cancel = CancellationToken::new();
        orch.wait_for_download_slot(&cancel).await.unwrap();
        cancel.cancel();
        let err = orch.wait_for_download_slot(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_slot_acquire_publishes_limit_change() {
        let (orch, _tx, bus) = orchestrator_with(limited(0, SpeedUnit::Bps, 2));
        let mut sub = bus.subscribe();
        orch.wait_for_download_slot(&CancellationToken::new()).await.unwrap();
        assert!(matches!(sub.recv().await, Some(SyncEvent::DownloadLimitChanged)));
    }

    #[test]
    fn test_cdn_uri_follows_connection_events() {
        let (orch, _tx, _bus) = orchestrator_with(TransferSettings::default());
        let server = ServerId::new();
        assert!(matches!(
            orch.require_cdn_uri(server),
            Err(TransferError::NotInitialized(id)) if id == server
        ));

        let connection = ConnectionDto {
            server_info: ServerInfo {
                file_server_address: "https://cdn.example".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        orch.handle_event(&SyncEvent::Connected {
            server,
            connection: Arc::new(connection),
        });
        assert_eq!(orch.require_cdn_uri(server).unwrap(), "https://cdn.example");

        orch.handle_event(&SyncEvent::Disconnected { server });
        assert!(orch.cdn_uri(server).is_none());
    }

    #[test]
    fn test_download_ready_flags() {
        let (orch, _tx, _bus) = orchestrator_with(TransferSettings::default());
        assert!(!orch.is_download_ready("r1"));
        orch.handle_event(&SyncEvent::DownloadReady {
            request_id: "r1".into(),
        });
        assert!(orch.is_download_ready("r1"));
        orch.clear_download_request("r1");
        assert!(!orch.is_download_ready("r1"));
    }

    #[test]
    fn test_forbidden_dedup_case_insensitive() {
        let (orch, _tx, _bus) = orchestrator_with(TransferSettings::default());
        let dto = |hash: &str| UploadFileDto {
            hash: hash.into(),
            is_forbidden: true,
            forbidden_by: "policy".into(),
        };
        orch.add_forbidden(UploadFileTransfer::new(dto("ABC"), ServerId::new(), 0));
        orch.add_forbidden(UploadFileTransfer::new(dto("abc"), ServerId::new(), 0));
        assert_eq!(orch.forbidden_transfers().len(), 1);
        assert!(orch.is_forbidden("aBc"));
        assert!(orch.forbidden_hashes().contains("ABC"));
    }
}
