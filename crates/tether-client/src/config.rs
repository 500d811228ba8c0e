//! Client configuration documents and their on-disk store.
//!
//! Two JSON documents live in the config directory: `config.json`
//! ([`SyncConfig`]) and `server.json` ([`ServerConfig`]). Server entries
//! are addressed by [`ServerId`] only; older documents that addressed the
//! selected server by list position are migrated on load.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use tether_files::{SpeedUnit, TransferSettings};
use tether_net::{
    AuthError, Credentials, HttpTokenSource, SessionConfig, TokenSource, TokenSourceFactory,
};
use tether_shared::constants::{APP_NAME, DEFAULT_PARALLEL_DOWNLOADS};
use tether_shared::{routes, ServerId};

use crate::error::{ClientError, ConfigError};
use crate::performance::PerformanceConfig;

pub const SERVER_CONFIG_VERSION: u32 = 3;

const SYNC_CONFIG_FILE: &str = "config.json";
const SERVER_CONFIG_FILE: &str = "server.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub parallel_downloads: usize,
    /// 0 or less means unlimited.
    pub download_speed_limit: i64,
    pub download_speed_unit: SpeedUnit,
    pub use_alternative_upload: bool,
    pub performance: PerformanceConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallel_downloads: DEFAULT_PARALLEL_DOWNLOADS,
            download_speed_limit: 0,
            download_speed_unit: SpeedUnit::Bps,
            use_alternative_upload: false,
            performance: PerformanceConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            parallel_downloads: self.parallel_downloads.max(1),
            download_speed_limit: self.download_speed_limit,
            speed_unit: self.download_speed_unit,
            use_alternative_upload: self.use_alternative_upload,
        }
    }
}

/// One configured backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStorage {
    /// Nil only in documents written before identities existed.
    #[serde(default = "ServerId::nil")]
    pub server_id: ServerId,
    /// Display name.
    pub server_name: String,
    /// Base URI; hub and API endpoints are derived from it.
    pub server_uri: String,
    /// Overrides the hub endpoint derived from `server_uri`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_uri: Option<String>,
    /// Overrides the API base derived from `server_uri`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_uri: Option<String>,
    /// Never connected automatically.
    #[serde(default)]
    pub full_pause: bool,
    /// Authenticate with `oauth_token` + `uid` instead of `secret_key`.
    #[serde(default)]
    pub use_oauth2: bool,
    /// Plain secret; sent hashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<String>,
    /// Account UID used with OAuth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Identifies the local character towards the server.
    #[serde(default)]
    pub chara_ident: String,
}

impl ServerStorage {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            server_id: ServerId::new(),
            server_name: name.into(),
            server_uri: uri.into(),
            hub_uri: None,
            api_uri: None,
            full_pause: false,
            use_oauth2: false,
            secret_key: None,
            oauth_token: None,
            uid: None,
            chara_ident: String::new(),
        }
    }

    pub fn hub_endpoint(&self) -> String {
        self.hub_uri
            .clone()
            .unwrap_or_else(|| routes::hub_uri(&self.server_uri))
    }

    pub fn api_endpoint(&self) -> String {
        self.api_uri
            .clone()
            .unwrap_or_else(|| routes::api_uri(&self.server_uri))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server: self.server_id,
            name: self.server_name.clone(),
            hub_uri: self.hub_endpoint(),
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        if self.use_oauth2 {
            Some(Credentials::OAuth {
                oauth_token: self.oauth_token.clone()?,
                uid: self.uid.clone()?,
                chara_ident: self.chara_ident.clone(),
            })
        } else {
            Some(Credentials::SecretKey {
                secret: self.secret_key.clone()?,
                chara_ident: self.chara_ident.clone(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Document version; see [`SERVER_CONFIG_VERSION`].
    #[serde(default)]
    pub version: u32,
    /// Position-based selection from older documents. Dropped by migration.
    #[serde(
        rename = "currentServer",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_current_server: Option<i64>,
    /// Server shown as primary by frontends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_server: Option<ServerId>,
    #[serde(default)]
    pub server_storage: Vec<ServerStorage>,
    /// Connect to every non-paused server rather than only the selected one.
    #[serde(default = "default_true")]
    pub enable_multi_connect: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: SERVER_CONFIG_VERSION,
            legacy_current_server: None,
            selected_server: None,
            server_storage: Vec::new(),
            enable_multi_connect: true,
        }
    }
}

impl ServerConfig {
    /// Bring an older document up to [`SERVER_CONFIG_VERSION`]. Returns
    /// whether anything changed.
    pub fn migrate(&mut self) -> bool {
        if self.version >= SERVER_CONFIG_VERSION {
            return false;
        }
        info!(from = self.version, to = SERVER_CONFIG_VERSION, "Migrating server config");

        for server in &mut self.server_storage {
            if server.server_id.is_nil() {
                server.server_id = ServerId::new();
            }
        }

        if self.selected_server.is_none() {
            let index = self.legacy_current_server.unwrap_or(0);
            self.selected_server = usize::try_from(index)
                .ok()
                .and_then(|i| self.server_storage.get(i))
                .or_else(|| self.server_storage.first())
                .map(|s| s.server_id);
        }

        self.legacy_current_server = None;
        self.version = SERVER_CONFIG_VERSION;
        true
    }

    pub fn server(&self, id: ServerId) -> Option<&ServerStorage> {
        self.server_storage.iter().find(|s| s.server_id == id)
    }

    pub fn server_mut(&mut self, id: ServerId) -> Option<&mut ServerStorage> {
        self.server_storage.iter_mut().find(|s| s.server_id == id)
    }

    pub fn add_server(&mut self, server: ServerStorage) -> ServerId {
        let id = server.server_id;
        self.server_storage.push(server);
        if self.selected_server.is_none() {
            self.selected_server = Some(id);
        }
        id
    }

    pub fn remove_server(&mut self, id: ServerId) -> Option<ServerStorage> {
        let index = self.server_storage.iter().position(|s| s.server_id == id)?;
        let removed = self.server_storage.remove(index);
        if self.selected_server == Some(id) {
            self.selected_server = self.server_storage.first().map(|s| s.server_id);
        }
        Some(removed)
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.server_storage.iter().map(|s| s.server_id).collect()
    }
}

/// Reads and writes the configuration documents.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The platform configuration directory for this application.
    pub fn open_default() -> Result<Self, ConfigError> {
        let dirs = directories::ProjectDirs::from("com", APP_NAME, APP_NAME)
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::at(dirs.config_dir()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn load_sync_config(&self) -> Result<SyncConfig, ConfigError> {
        self.load(SYNC_CONFIG_FILE).await
    }

    pub async fn save_sync_config(&self, config: &SyncConfig) -> Result<(), ConfigError> {
        self.save(SYNC_CONFIG_FILE, config).await
    }

    /// Load the server list, migrating and re-saving older documents.
    pub async fn load_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let mut config: ServerConfig = self.load(SERVER_CONFIG_FILE).await?;
        if config.migrate() {
            self.save_server_config(&config).await?;
        }
        Ok(config)
    }

    pub async fn save_server_config(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        self.save(SERVER_CONFIG_FILE, config).await
    }

    async fn load<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, ConfigError> {
        let path = self.dir.join(name);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Malformed { path, source })
    }

    async fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let path = self.dir.join(name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp, json)
            .await
            .map_err(|source| ConfigError::Io {
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| ConfigError::Io { path, source })
    }
}

/// Shared, live view of the server list. Resolves identities to endpoints
/// and credentials; unknown identities are errors.
#[derive(Clone)]
pub struct ServerDirectory {
    config: Arc<RwLock<ServerConfig>>,
    http: reqwest::Client,
}

impl ServerDirectory {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            http: reqwest::Client::new(),
        }
    }

    pub fn snapshot(&self) -> ServerConfig {
        self.read().clone()
    }

    pub fn server(&self, id: ServerId) -> Result<ServerStorage, ClientError> {
        self.read()
            .server(id)
            .cloned()
            .ok_or(ClientError::UnknownServer(id))
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.read().server_ids()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ServerConfig) -> R) -> R {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        f(&mut config)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ServerConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl TokenSourceFactory for ServerDirectory {
    fn source_for(&self, server: ServerId) -> Result<Arc<dyn TokenSource>, AuthError> {
        let storage = self
            .read()
            .server(server)
            .cloned()
            .ok_or(AuthError::MissingCredentials(server))?;
        let credentials = storage.credentials().ok_or_else(|| {
            warn!(server = %server, "No credentials configured");
            AuthError::MissingCredentials(server)
        })?;
        Ok(Arc::new(HttpTokenSource::new(
            self.http.clone(),
            storage.api_endpoint(),
            credentials,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn legacy_document(current: i64) -> String {
        serde_json::json!({
            "version": 2,
            "currentServer": current,
            "serverStorage": [
                { "serverName": "First", "serverUri": "wss://one.example" },
                { "serverName": "Second", "serverUri": "wss://two.example" }
            ]
        })
        .to_string()
    }

    #[test]
    fn test_migration_assigns_ids_and_maps_selection() {
        let mut config: ServerConfig = serde_json::from_str(&legacy_document(1)).unwrap();
        assert!(config.migrate());
        assert_eq!(config.version, SERVER_CONFIG_VERSION);
        assert!(config.server_storage.iter().all(|s| !s.server_id.is_nil()));
        assert_ne!(
            config.server_storage[0].server_id,
            config.server_storage[1].server_id
        );
        assert_eq!(config.selected_server, Some(config.server_storage[1].server_id));
        assert!(config.legacy_current_server.is_none());
        assert!(!serde_json::to_string(&config).unwrap().contains("currentServer"));
        assert!(!config.migrate());
    }

    #[test]
    fn test_migration_out_of_range_index_falls_back_to_first() {
        let mut config: ServerConfig = serde_json::from_str(&legacy_document(7)).unwrap();
        config.migrate();
        assert_eq!(config.selected_server, Some(config.server_storage[0].server_id));

        let mut config: ServerConfig = serde_json::from_str(&legacy_document(-1)).unwrap();
        config.migrate();
        assert_eq!(config.selected_server, Some(config.server_storage[0].server_id));
    }

    #[test]
    fn test_migration_of_empty_list_leaves_selection_unset() {
        let mut config: ServerConfig =
            serde_json::from_str(r#"{"version":2,"currentServer":0}"#).unwrap();
        assert!(config.migrate());
        assert!(config.selected_server.is_none());
    }

    #[test]
    fn test_remove_selected_server_reselects() {
        let mut config = ServerConfig::default();
        let a = config.add_server(ServerStorage::new("A", "wss://a"));
        let b = config.add_server(ServerStorage::new("B", "wss://b"));
        assert_eq!(config.selected_server, Some(a));
        config.remove_server(a);
        assert_eq!(config.selected_server, Some(b));
    }

    #[test]
    fn test_endpoints_and_credentials() {
        let mut server = ServerStorage::new("A", "wss://sync.example");
        assert_eq!(server.hub_endpoint(), "wss://sync.example/sync");
        assert_eq!(server.api_endpoint(), "https://sync.example");
        assert!(server.credentials().is_none());

        server.secret_key = Some("s3cret".into());
        assert!(matches!(server.credentials(), Some(Credentials::SecretKey { .. })));

        server.use_oauth2 = true;
        server.oauth_token = Some("oauth".into());
        assert!(server.credentials().is_none());
        server.uid = Some("ME".into());
        assert!(matches!(server.credentials(), Some(Credentials::OAuth { .. })));
    }

    #[test]
    fn test_directory_rejects_unknown_server() {
        let directory = ServerDirectory::new(ServerConfig::default());
        let unknown = ServerId::new();
        assert!(matches!(
            directory.server(unknown),
            Err(ClientError::UnknownServer(id)) if id == unknown
        ));
        assert!(matches!(
            directory.source_for(unknown),
            Err(AuthError::MissingCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_store_migrates_and_persists() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SERVER_CONFIG_FILE), legacy_document(0)).unwrap();
        let store = ConfigStore::at(dir.path());

        let config = store.load_server_config().await.unwrap();
        assert_eq!(config.version, SERVER_CONFIG_VERSION);

        let reloaded = store.load_server_config().await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_store_defaults_and_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::at(dir.path().join("nested"));
        assert_eq!(store.load_sync_config().await.unwrap(), SyncConfig::default());

        let config = SyncConfig {
            parallel_downloads: 3,
            download_speed_limit: 500,
            download_speed_unit: SpeedUnit::KBps,
            ..Default::default()
        };
        store.save_sync_config(&config).await.unwrap();
        assert_eq!(store.load_sync_config().await.unwrap(), config);
        assert_eq!(config.transfer_settings().speed_unit, SpeedUnit::KBps);
    }

    #[tokio::test]
    async fn test_store_reports_malformed_document() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SYNC_CONFIG_FILE), b"{ not json").unwrap();
        let store = ConfigStore::at(dir.path());
        assert!(matches!(
            store.load_sync_config().await,
            Err(ConfigError::Malformed { .. })
        ));
    }
}
