use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use tether_shared::munge::munge_buffer;
use tether_shared::protocol::{FilesSendDto, UploadFileDto};
use tether_shared::routes;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::file_store::FileStore;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

/// Request counters, readable by tests and the health endpoint.
#[derive(Debug, Default)]
pub struct Stats {
    pub files_send_requests: AtomicU64,
    pub uploads: AtomicU64,
    pub munged_uploads: AtomicU64,
}

impl Stats {
    pub fn files_send_requests(&self) -> u64 {
        self.files_send_requests.load(Ordering::Relaxed)
    }

    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn munged_uploads(&self) -> u64 {
        self.munged_uploads.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.files_send_requests() + self.uploads() + self.munged_uploads()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FileStore>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub stats: Arc<Stats>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = FileStore::new(config.file_storage_path.clone(), config.max_file_size).await?;
        Ok(Self {
            store: Arc::new(store),
            rate_limiter: RateLimiter::default(),
            config: Arc::new(config),
            stats: Arc::new(Stats::default()),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_file_size;

    Router::new()
        .route(routes::FILES_SEND, post(files_send))
        .route(&format!("{}/:hash", routes::FILES_UPLOAD), post(upload))
        .route(&format!("{}/:hash", routes::FILES_UPLOAD_MUNGED), post(upload_munged))
        .route(routes::FILES_DELETE_ALL, post(delete_all))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    file_server_address: Option<String>,
    files_send_requests: u64,
    uploads: u64,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        file_server_address: state.config.cdn_base_url.clone(),
        files_send_requests: state.stats.files_send_requests(),
        uploads: state.stats.uploads() + state.stats.munged_uploads(),
    })
}

/// Answer which of the requested hashes still need uploading. Hashes
/// already stored are omitted; forbidden ones come back flagged.
async fn files_send(
    State(state): State<AppState>,
    Json(request): Json<FilesSendDto>,
) -> Result<Json<Vec<UploadFileDto>>, ServerError> {
    state.stats.files_send_requests.fetch_add(1, Ordering::Relaxed);

    let requested: BTreeSet<&str> = request.file_hashes.iter().map(String::as_str).collect();
    let mut answers = Vec::new();
    for hash in requested {
        routes::validate_hash(hash).map_err(|e| ServerError::BadRequest(e.to_string()))?;
        if let Some(reason) = state.config.forbidden_reason(hash) {
            answers.push(UploadFileDto {
                hash: hash.to_string(),
                is_forbidden: true,
                forbidden_by: reason.to_string(),
            });
        } else if !state.store.exists(hash) {
            answers.push(UploadFileDto {
                hash: hash.to_string(),
                ..Default::default()
            });
        }
    }

    debug!(
        requested = request.file_hashes.len(),
        answered = answers.len(),
        peers = request.uids.len(),
        "filesSend"
    );
    Ok(Json(answers))
}

async fn upload(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    if !state.config.plain_upload_enabled {
        return Err(ServerError::Unavailable("plain uploads are disabled".into()));
    }
    store_checked(&state, &hash, &body).await?;
    state.stats.uploads.fetch_add(1, Ordering::Relaxed);
    info!(hash = %hash, size = body.len(), "File uploaded");
    Ok(StatusCode::OK)
}

async fn upload_munged(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let mut data = body.to_vec();
    munge_buffer(&mut data);
    store_checked(&state, &hash, &data).await?;
    state.stats.munged_uploads.fetch_add(1, Ordering::Relaxed);
    info!(hash = %hash, size = data.len(), "File uploaded (munged)");
    Ok(StatusCode::OK)
}

async fn delete_all(State(state): State<AppState>) -> Result<StatusCode, ServerError> {
    state.store.delete_all().await?;
    Ok(StatusCode::OK)
}

async fn store_checked(state: &AppState, hash: &str, data: &[u8]) -> Result<(), ServerError> {
    if let Some(reason) = state.config.forbidden_reason(hash) {
        return Err(ServerError::Forbidden(reason.to_string()));
    }
    state.store.store(hash, data).await
}

async fn require_bearer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    verify_bearer(req.headers(), &state.config)?;
    Ok(next.run(req).await)
}

fn verify_bearer(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    if config.auth_tokens.is_empty() {
        return Ok(());
    }

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth).as_bytes();

    use subtle::ConstantTimeEq;
    let accepted = config.auth_tokens.iter().any(|expected| {
        let expected = expected.as_bytes();
        token.len() == expected.len() && token.ct_eq(expected).unwrap_u8() == 1
    });
    if accepted {
        Ok(())
    } else {
        Err(ServerError::Unauthorized)
    }
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    let app = build_router(state);
    info!(addr = ?listener.local_addr().ok(), "Starting file host");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn state(config: ServerConfig) -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            file_storage_path: dir.path().to_path_buf(),
            ..config
        };
        (AppState::new(config).await.unwrap(), dir)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_files_send_reports_needed_and_forbidden() {
        let (state, _dir) = state(ServerConfig {
            forbidden_hashes: vec![("BB".into(), "copyright".into())],
            ..Default::default()
        })
        .await;
        state.store.store("CC", b"stored").await.unwrap();
        let app = build_router(state.clone());

        let response = app
            .oneshot(post_json(
                "/files/filesSend",
                serde_json::json!({ "fileHashes": ["AA", "BB", "CC", "AA"], "UIDs": ["P1"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let answers: Vec<UploadFileDto> = read_json(response).await;
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].hash, "AA");
        assert!(!answers[0].is_forbidden);
        assert_eq!(answers[1].hash, "BB");
        assert!(answers[1].is_forbidden);
        assert_eq!(answers[1].forbidden_by, "copyright");
        assert_eq!(state.stats.files_send_requests(), 1);
    }

    #[tokio::test]
    async fn test_munged_upload_is_restored() {
        let (state, _dir) = state(ServerConfig::default()).await;
        let app = build_router(state.clone());
        let mut body = b"texture".to_vec();
        munge_buffer(&mut body);

        let response = app
            .oneshot(
                Request::post("/files/uploadMunged/ABCD")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.store.get("ABCD").await.unwrap(), b"texture");
        assert_eq!(state.stats.munged_uploads(), 1);
    }

    #[tokio::test]
    async fn test_plain_upload_can_be_disabled() {
        let (state, _dir) = state(ServerConfig {
            plain_upload_enabled: false,
            ..Default::default()
        })
        .await;
        let response = build_router(state)
            .oneshot(Request::post("/files/upload/AA").body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_bearer_required_when_configured() {
        let (state, _dir) = state(ServerConfig {
            auth_tokens: vec!["secret".into()],
            ..Default::default()
        })
        .await;
        let app = build_router(state);

        let denied = app
            .clone()
            .oneshot(Request::post("/files/upload/AA").body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .clone()
            .oneshot(
                Request::post("/files/upload/AA")
                    .header("authorization", "Bearer secret")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);

        let health = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forbidden_upload_rejected() {
        let (state, _dir) = state(ServerConfig {
            forbidden_hashes: vec![("AA".into(), "nope".into())],
            ..Default::default()
        })
        .await;
        let response = build_router(state.clone())
            .oneshot(Request::post("/files/upload/aa").body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!state.store.exists("AA"));
    }

    #[tokio::test]
    async fn test_delete_all() {
        let (state, _dir) = state(ServerConfig::default()).await;
        state.store.store("AA", b"1").await.unwrap();
        let response = build_router(state.clone())
            .oneshot(Request::post("/files/deleteAll").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.store.exists("AA"));
    }
}
