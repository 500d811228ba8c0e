//! Bearer tokens for the hub channel and the file transport.
//!
//! Each server gets one [`AuthTokenProvider`]. It caches the last token and
//! renews it shortly before the JWT `exp` claim runs out. How a token is
//! actually obtained is behind the [`TokenSource`] seam.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tether_shared::constants::TOKEN_REFRESH_MARGIN_SECS;
use tether_shared::{routes, ServerId};

use crate::error::AuthError;

/// Something that can produce a fresh bearer token for one server.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<String, AuthError>;

    /// Exchange a still-valid token for a fresh one. Sources without a
    /// renewal endpoint fall back to a full fetch.
    async fn renew_token(&self, _current: &str) -> Result<String, AuthError> {
        self.fetch_token().await
    }
}

/// How a server account authenticates.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Static secret key; only its SHA-256 digest leaves the machine.
    SecretKey { secret: String, chara_ident: String },
    /// OAuth2 login token obtained out of band.
    OAuth {
        oauth_token: String,
        uid: String,
        chara_ident: String,
    },
}

/// Token source talking to a server's `/auth` endpoints.
pub struct HttpTokenSource {
    http: reqwest::Client,
    api_uri: String,
    credentials: Credentials,
}

impl HttpTokenSource {
    pub fn new(http: reqwest::Client, api_uri: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http,
            api_uri: api_uri.into(),
            credentials,
        }
    }

    async fn read_token(response: reqwest::Response) -> Result<String, AuthError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let token = body.trim().trim_matches('"').to_string();
        if token.is_empty() {
            return Err(AuthError::MalformedToken("empty token".into()));
        }
        Ok(token)
    }
}

/// Uppercase hex SHA-256, the form in which secret keys are sent.
pub fn hash_secret(secret: &str) -> String {
    hex::encode_upper(Sha256::digest(secret.as_bytes()))
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch_token(&self) -> Result<String, AuthError> {
        let response = match &self.credentials {
            Credentials::SecretKey {
                secret,
                chara_ident,
            } => {
                debug!(api = %self.api_uri, "Requesting token with secret key");
                self.http
                    .post(routes::auth_create_ident(&self.api_uri))
                    .form(&[
                        ("auth", hash_secret(secret)),
                        ("charaIdent", chara_ident.clone()),
                    ])
                    .send()
                    .await?
            }
            Credentials::OAuth {
                oauth_token,
                uid,
                chara_ident,
            } => {
                debug!(api = %self.api_uri, uid = %uid, "Requesting token with OAuth login");
                self.http
                    .post(routes::auth_create_ident_oauth(&self.api_uri))
                    .bearer_auth(oauth_token)
                    .form(&[("uid", uid.clone()), ("charaIdent", chara_ident.clone())])
                    .send()
                    .await?
            }
        };
        Self::read_token(response).await
    }

    async fn renew_token(&self, current: &str) -> Result<String, AuthError> {
        let response = self
            .http
            .get(routes::auth_renew_token(&self.api_uri))
            .bearer_auth(current)
            .send()
            .await?;
        match Self::read_token(response).await {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!(api = %self.api_uri, error = %e, "Token renewal failed; requesting a new token");
                self.fetch_token().await
            }
        }
    }
}

/// A fixed token. Used for servers configured with a pre-issued bearer
/// and in tests.
pub struct StaticTokenSource(pub String);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch_token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// Expiry from a JWT's `exp` claim. `None` for opaque tokens or tokens
/// without the claim.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn new(token: String) -> Self {
        let expires_at = token_expiry(&token);
        Self { token, expires_at }
    }

    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => exp - Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) <= now,
            None => false,
        }
    }
}

/// Per-server token cache.
pub struct AuthTokenProvider {
    server: ServerId,
    source: Arc<dyn TokenSource>,
    cached: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

impl AuthTokenProvider {
    pub fn new(server: ServerId, source: Arc<dyn TokenSource>) -> Self {
        Self {
            server,
            source,
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn server(&self) -> ServerId {
        self.server
    }

    /// The cached token, if any. Never triggers a refresh.
    pub fn get_cached_token(&self) -> Option<String> {
        self.cached
            .read()
            .ok()
            .and_then(|c| c.as_ref().map(|t| t.token.clone()))
    }

    /// A token valid for at least the refresh margin, fetching or renewing
    /// as needed. Concurrent callers share one refresh.
    pub async fn get_or_update_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.fresh_cached(Utc::now()) {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        if let Some(token) = self.fresh_cached(Utc::now()) {
            return Ok(token);
        }

        let stale = self.get_cached_token();
        let token = match stale {
            Some(current) => {
                debug!(server = %self.server, "Renewing expiring token");
                self.source.renew_token(&current).await?
            }
            None => self.source.fetch_token().await?,
        };
        info!(server = %self.server, "Obtained bearer token");
        self.store(token.clone());
        Ok(token)
    }

    /// Forget the cached token, e.g. after the server answered 401.
    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.write() {
            *cached = None;
        }
    }

    fn fresh_cached(&self, now: DateTime<Utc>) -> Option<String> {
        let cached = self.cached.read().ok()?;
        cached
            .as_ref()
            .filter(|t| !t.needs_refresh(now))
            .map(|t| t.token.clone())
    }

    fn store(&self, token: String) {
        if let Ok(mut cached) = self.cached.write() {
            *cached = Some(CachedToken::new(token));
        }
    }
}

/// Builds the token source for a server on first use.
pub trait TokenSourceFactory: Send + Sync {
    fn source_for(&self, server: ServerId) -> Result<Arc<dyn TokenSource>, AuthError>;
}

/// One [`AuthTokenProvider`] per server, created lazily.
#[derive(Clone)]
pub struct TokenRegistry {
    providers: Arc<DashMap<ServerId, Arc<AuthTokenProvider>>>,
    factory: Arc<dyn TokenSourceFactory>,
}

impl TokenRegistry {
    pub fn new(factory: Arc<dyn TokenSourceFactory>) -> Self {
        Self {
            providers: Arc::new(DashMap::new()),
            factory,
        }
    }

    pub fn provider(&self, server: ServerId) -> Result<Arc<AuthTokenProvider>, AuthError> {
        if let Some(existing) = self.providers.get(&server) {
            return Ok(existing.clone());
        }
        let source = self.factory.source_for(server)?;
        let provider = self
            .providers
            .entry(server)
            .or_insert_with(|| Arc::new(AuthTokenProvider::new(server, source)))
            .clone();
        Ok(provider)
    }

    pub fn cached_token(&self, server: ServerId) -> Option<String> {
        self.providers
            .get(&server)
            .and_then(|p| p.get_cached_token())
    }

    pub async fn get_or_update_token(&self, server: ServerId) -> Result<String, AuthError> {
        self.provider(server)?.get_or_update_token().await
    }

    /// Drop a server's provider, e.g. after its credentials changed.
    pub fn remove(&self, server: ServerId) {
        self.providers.remove(&server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        fetches: AtomicUsize,
        renewals: AtomicUsize,
        token: String,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<String, AuthError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.clone())
        }

        async fn renew_token(&self, _current: &str) -> Result<String, AuthError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.clone())
        }
    }

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{payload}.sig")
    }

    fn counting(token: String) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            token,
        })
    }

    #[test]
    fn test_token_expiry_parsing() {
        let token = jwt_with_exp(1_900_000_000);
        assert_eq!(token_expiry(&token).map(|t| t.timestamp()), Some(1_900_000_000));
        assert_eq!(token_expiry("opaque-token"), None);
    }

    #[test]
    fn test_hash_secret_is_upper_hex() {
        let hashed = hash_secret("secret");
        assert_eq!(hashed.len(), 64);
        assert!(hashed.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_cached_token_never_refreshes() {
        let source = counting("opaque".into());
        let provider = AuthTokenProvider::new(ServerId::new(), source.clone());
        assert_eq!(provider.get_cached_token(), None);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);

        provider.get_or_update_token().await.unwrap();
        assert_eq!(provider.get_cached_token().as_deref(), Some("opaque"));
        provider.get_or_update_token().await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiring_token_is_renewed() {
        let soon = Utc::now().timestamp() + 10;
        let source = counting(jwt_with_exp(soon));
        let provider = AuthTokenProvider::new(ServerId::new(), source.clone());
        provider.get_or_update_token().await.unwrap();
        provider.get_or_update_token().await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(source.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_fetch() {
        let source = counting("opaque".into());
        let provider = AuthTokenProvider::new(ServerId::new(), source.clone());
        provider.get_or_update_token().await.unwrap();
        provider.invalidate();
        assert_eq!(provider.get_cached_token(), None);
        provider.get_or_update_token().await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    struct StaticFactory;

    impl TokenSourceFactory for StaticFactory {
        fn source_for(&self, server: ServerId) -> Result<Arc<dyn TokenSource>, AuthError> {
            Ok(Arc::new(StaticTokenSource(format!("token-{}", server.short()))))
        }
    }

    #[tokio::test]
    async fn test_registry_creates_one_provider_per_server() {
        let registry = TokenRegistry::new(Arc::new(StaticFactory));
        let a = ServerId::new();
        let b = ServerId::new();
        let pa = registry.provider(a).unwrap();
        assert!(Arc::ptr_eq(&pa, &registry.provider(a).unwrap()));
        assert_eq!(registry.cached_token(a), None);

        let ta = registry.get_or_update_token(a).await.unwrap();
        let tb = registry.get_or_update_token(b).await.unwrap();
        assert_ne!(ta, tb);
        assert_eq!(registry.cached_token(a), Some(ta));
    }
}
