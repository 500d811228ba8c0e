// Client core: configuration, the session registry and snapshot fan-out.

pub mod config;
pub mod distributor;
pub mod error;
pub mod performance;
pub mod registry;
pub mod render_lock;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tether_files::{DirFileCache, FileCache, TransferOrchestrator, TransferSettings, UploadManager};
use tether_net::{HubConnector, TokenRegistry, TokenSourceFactory, WsHubConnector};
use tether_shared::{EventBus, SyncEvent};

pub use config::{ConfigStore, ServerConfig, ServerDirectory, ServerStorage, SyncConfig};
pub use distributor::{
    FanoutDistributor, SnapshotPusher, SnapshotUploader, VisiblePeerSet, VisiblePeers,
};
pub use error::{ClientError, ConfigError, Result};
pub use performance::{PeerContext, PerformanceConfig, PerformanceGuard, PerformancePolicy, ThresholdPolicy};
pub use registry::SessionRegistry;
pub use render_lock::RenderLocks;

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tether_client=debug,tether_net=debug,tether_files=debug,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Everything a running client owns, wired to one event bus.
pub struct SyncClient {
    bus: EventBus,
    directory: ServerDirectory,
    settings: watch::Sender<TransferSettings>,
    orchestrator: Arc<TransferOrchestrator>,
    uploads: UploadManager,
    sessions: Arc<SessionRegistry>,
    distributor: Arc<FanoutDistributor>,
    performance: PerformanceGuard,
    render_locks: RenderLocks,
    shutdown: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Load both config files from `store` and start with the websocket
    /// connector and an on-disk file cache next to the config.
    pub async fn open(store: &ConfigStore, peers: Arc<dyn VisiblePeers>) -> Result<Self> {
        let sync = store.load_sync_config().await?;
        let servers = store.load_server_config().await?;
        let cache = Arc::new(DirFileCache::new(store.dir().join("cache")));
        let directory = ServerDirectory::new(servers);
        let factory = Arc::new(directory.clone());
        Self::with_backends(sync, directory, cache, peers, Arc::new(WsHubConnector), factory)
    }

    pub fn with_backends(
        sync: SyncConfig,
        directory: ServerDirectory,
        cache: Arc<dyn FileCache>,
        peers: Arc<dyn VisiblePeers>,
        connector: Arc<dyn HubConnector>,
        token_factory: Arc<dyn TokenSourceFactory>,
    ) -> Result<Self> {
        let bus = EventBus::new();
        let shutdown = CancellationToken::new();
        let tokens = TokenRegistry::new(token_factory);

        let (settings, settings_rx) = watch::channel(sync.transfer_settings());
        let orchestrator = Arc::new(TransferOrchestrator::new(
            tokens.clone(),
            bus.clone(),
            settings_rx,
        )?);
        let uploads = UploadManager::new(orchestrator.clone(), cache, shutdown.child_token());
        let sessions = Arc::new(SessionRegistry::new(
            directory.clone(),
            tokens,
            connector,
            bus.clone(),
        ));
        let distributor =
            FanoutDistributor::new(peers, Arc::new(uploads.clone()), sessions.clone());
        let performance = PerformanceGuard::new(
            Arc::new(ThresholdPolicy::new(sync.performance.clone())),
            bus.clone(),
        );

        let listeners = vec![
            orchestrator.spawn_event_listener(shutdown.child_token()),
            uploads.spawn_event_listener(&bus),
            tokio::spawn(distributor.clone().run(bus.clone(), shutdown.child_token())),
        ];
        info!(servers = directory.server_ids().len(), "Sync client started");

        Ok(Self {
            bus,
            directory,
            settings,
            orchestrator,
            uploads,
            sessions,
            distributor,
            performance,
            render_locks: RenderLocks::new(),
            shutdown,
            listeners,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn directory(&self) -> &ServerDirectory {
        &self.directory
    }

    pub fn orchestrator(&self) -> &Arc<TransferOrchestrator> {
        &self.orchestrator
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn distributor(&self) -> &Arc<FanoutDistributor> {
        &self.distributor
    }

    pub fn performance(&self) -> &PerformanceGuard {
        &self.performance
    }

    pub fn render_locks(&self) -> &RenderLocks {
        &self.render_locks
    }

    /// Apply new transfer settings; slot waiters pick them up on their next
    /// check.
    pub fn update_sync_config(&self, sync: &SyncConfig) {
        self.settings.send_replace(sync.transfer_settings());
        self.bus.publish(SyncEvent::DownloadLimitChanged);
    }

    /// Disconnect every server and stop all background work.
    pub async fn shutdown(mut self) {
        info!("Shutting down sync client");
        self.sessions.disconnect_all().await;
        self.uploads.shutdown();
        self.shutdown.cancel();
        for listener in self.listeners.drain(..) {
            let _ = listener.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_files::MemoryFileCache;

    use crate::registry::tests::{TestConnector, TestFactory};

    fn client_with(servers: Vec<ServerStorage>) -> (SyncClient, Arc<TestConnector>) {
        let mut config = ServerConfig::default();
        for server in servers {
            config.add_server(server);
        }
        let connector = Arc::new(TestConnector::default());
        let client = SyncClient::with_backends(
            SyncConfig::default(),
            ServerDirectory::new(config),
            Arc::new(MemoryFileCache::new()),
            Arc::new(VisiblePeerSet::new()),
            connector.clone(),
            Arc::new(TestFactory),
        )
        .unwrap();
        (client, connector)
    }

    #[tokio::test]
    async fn test_connect_then_shutdown() {
        let (client, _connector) = client_with(vec![
            ServerStorage::new("A", "wss://a"),
            ServerStorage::new("B", "wss://b"),
        ]);
        let results = client.sessions().auto_connect().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(client.sessions().any_connected());

        let sessions = client.sessions().clone();
        client.shutdown().await;
        assert!(!sessions.any_connected());
    }

    #[tokio::test]
    async fn test_sync_config_updates_transfer_settings() {
        let (client, _connector) = client_with(vec![]);
        let mut events = client.bus().subscribe();
        let sync = SyncConfig {
            parallel_downloads: 7,
            ..Default::default()
        };
        client.update_sync_config(&sync);
        assert_eq!(client.orchestrator().settings().parallel_downloads, 7);
        assert!(matches!(events.try_recv(), Some(SyncEvent::DownloadLimitChanged)));
        client.shutdown().await;
    }
}
