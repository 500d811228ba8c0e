//! Per-server upload pipeline.
//!
//! Before a snapshot goes out to a server, every file it references must
//! exist there. The manager asks the server which hashes it still needs,
//! then compresses and streams them one after another, overlapping the
//! compression of the next file with the upload of the current one.
//!
//! Each server has its own cancellation token. A new upload for a server
//! cancels the previous one. Different servers never wait on each other.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::stream;
use reqwest::Method;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_shared::constants::{UPLOAD_CHUNK_SIZE, UPLOAD_VERIFICATION_WINDOW_SECS};
use tether_shared::munge::munged;
use tether_shared::protocol::{FilesSendDto, UploadFileDto};
use tether_shared::{routes, CharacterData, EventBus, ServerId, SyncEvent, UserData};

use crate::cache::FileCache;
use crate::error::{Result, TransferError};
use crate::orchestrator::{RequestBody, TransferOrchestrator};
use crate::transfer::{FileTransfer, UploadFileTransfer};

struct UploadInner {
    orchestrator: Arc<TransferOrchestrator>,
    cache: Arc<dyn FileCache>,
    /// (server, hash) -> last time that server confirmed having the file.
    verified: DashMap<(ServerId, String), DateTime<Utc>>,
    /// Token of the newest upload per server; older ones are cancelled.
    tokens: DashMap<ServerId, CancellationToken>,
    /// Transfers of the newest upload per server.
    current: DashMap<ServerId, Vec<UploadFileTransfer>>,
    /// Parent of every per-server token.
    shutdown: CancellationToken,
}

/// Uploads snapshot files to servers. Clones share all state.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<UploadInner>,
}

impl UploadManager {
    pub fn new(
        orchestrator: Arc<TransferOrchestrator>,
        cache: Arc<dyn FileCache>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(UploadInner {
                orchestrator,
                cache,
                verified: DashMap::new(),
                tokens: DashMap::new(),
                current: DashMap::new(),
                shutdown,
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<TransferOrchestrator> {
        &self.inner.orchestrator
    }

    /// Every in-flight upload across all servers.
    pub fn current_uploads(&self) -> Vec<UploadFileTransfer> {
        self.inner
            .current
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }

    pub fn is_uploading(&self, server: ServerId) -> bool {
        self.inner
            .current
            .get(&server)
            .is_some_and(|uploads| !uploads.is_empty())
    }

    /// Make sure every file `data` references exists on `server`, then
    /// return the snapshot with forbidden files removed.
    ///
    /// `visible` are the peers the snapshot is meant for; their UIDs go to
    /// the server with the existence check.
    pub async fn upload_character_data(
        &self,
        server: ServerId,
        data: &CharacterData,
        visible: &[UserData],
    ) -> Result<CharacterData> {
        let token = self.begin(server);
        debug!(server = %server, hash = %data.data_hash(), "Uploading character data");

        let unverified = self.unverified_hashes(server, data);
        if !unverified.is_empty() {
            let outcome = self
                .upload_unverified(server, unverified, visible, &token)
                .await;
            self.finish(server, &token);
            outcome?;
            info!(server = %server, hash = %data.data_hash(), "Upload complete");
        }

        Ok(data.without_hashes(&self.inner.orchestrator.forbidden_hashes()))
    }

    /// Upload an explicit list of hashes.
    ///
    /// Returns the hashes missing from the local cache (nothing is sent),
    /// or the hashes the server forbids (nothing is uploaded), or an empty
    /// list once everything is uploaded.
    pub async fn upload_files<P>(
        &self,
        server: ServerId,
        hashes: &[String],
        progress: P,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>
    where
        P: Fn(String) + Send + Sync,
    {
        debug!(server = %server, count = hashes.len(), "Uploading files");
        let missing: Vec<String> = hashes
            .iter()
            .filter(|h| self.inner.cache.get_by_hash(h).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Ok(missing);
        }
        let present: Vec<String> = hashes
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        progress(format!("Starting upload for {} files", present.len()));
        let answers = self.files_send(server, &present, &[], cancel).await?;

        let forbidden: Vec<String> = answers
            .iter()
            .filter(|a| a.is_forbidden)
            .map(|a| a.hash.clone())
            .collect();
        if !forbidden.is_empty() {
            return Ok(forbidden);
        }

        let mut in_flight: Option<JoinHandle<()>> = None;
        for (i, answer) in answers.iter().enumerate() {
            progress(format!(
                "Uploading file {}/{}. Please wait until the upload is completed.",
                i + 1,
                answers.len()
            ));
            debug!(hash = %answer.hash, "Compressing");
            let data = self
                .inner
                .cache
                .get_compressed_data(&answer.hash, cancel)
                .await?;
            let transfer = UploadFileTransfer::new(answer.clone(), server, data.len() as u64);
            if let Some(previous) = in_flight.take() {
                let _ = previous.await;
            }
            in_flight = Some(tokio::spawn(self.clone().upload_file(
                server,
                data,
                transfer,
                cancel.clone(),
            )));
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
        }
        if let Some(last) = in_flight {
            let _ = last.await;
        }
        Ok(Vec::new())
    }

    pub async fn delete_all_files(&self, server: ServerId) -> Result<()> {
        let cdn = self.inner.orchestrator.require_cdn_uri(server)?;
        let uri = routes::files_delete_all(&cdn);
        let response = self
            .inner
            .orchestrator
            .send_request(server, Method::POST, &uri, RequestBody::Empty, None)
            .await?;
        check_status(response, &uri)?;
        info!(server = %server, "Deleted all files");
        Ok(())
    }

    /// Forget everything about `server`'s uploads. Called on disconnect.
    pub fn reset_for_server(&self, server: ServerId) {
        self.cancel_server(server);
        self.inner.verified.retain(|(s, _), _| *s != server);
    }

    /// Cancel everything and clear all state.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tokens.clear();
        self.inner.current.clear();
        self.inner.verified.clear();
    }

    pub fn handle_event(&self, event: &SyncEvent) {
        if let SyncEvent::Disconnected { server } = event {
            debug!(server = %server, "Resetting uploads after disconnect");
            self.reset_for_server(*server);
        }
    }

    pub fn spawn_event_listener(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => this.handle_event(&event),
                        None => break,
                    },
                }
            }
        })
    }

    // -- internals ----------------------------------------------------------

    /// Cancel the previous upload for `server` and hand out a fresh token.
    fn begin(&self, server: ServerId) -> CancellationToken {
        self.cancel_server(server);
        let token = self.inner.shutdown.child_token();
        self.inner.tokens.insert(server, token.clone());
        token
    }

    /// Drop `server`'s transfer list unless a newer call, which cancelled
    /// `token`, owns it by now.
    fn finish(&self, server: ServerId, token: &CancellationToken) {
        self.inner
            .current
            .remove_if(&server, |_, _| !token.is_cancelled());
    }

    fn cancel_server(&self, server: ServerId) {
        if let Some((_, token)) = self.inner.tokens.remove(&server) {
            token.cancel();
        }
        self.inner.current.remove(&server);
    }

    fn mark_verified(&self, server: ServerId, hash: &str) {
        self.inner
            .verified
            .insert((server, hash.to_string()), Utc::now());
    }

    /// Hashes `server` has not confirmed within the verification window.
    fn unverified_hashes(&self, server: ServerId, data: &CharacterData) -> BTreeSet<String> {
        let cutoff = Utc::now() - Duration::seconds(UPLOAD_VERIFICATION_WINDOW_SECS);
        data.referenced_hashes()
            .into_iter()
            .filter(|hash| match self.inner.verified.get(&(server, hash.clone())) {
                Some(at) if *at >= cutoff => false,
                last => {
                    trace!(hash = %hash, last_verified = ?last.map(|t| *t), "Verifying");
                    true
                }
            })
            .collect()
    }

    async fn upload_unverified(
        &self,
        server: ServerId,
        unverified: BTreeSet<String>,
        visible: &[UserData],
        token: &CancellationToken,
    ) -> Result<()> {
        let local: Vec<String> = unverified
            .into_iter()
            .filter(|h| self.inner.cache.get_by_hash(h).is_some())
            .collect();
        debug!(server = %server, count = local.len(), "Verifying files");

        let uids: Vec<String> = visible.iter().map(|u| u.uid.clone()).collect();
        let answers = self.files_send(server, &local, &uids, token).await?;

        let mut uploads: Vec<UploadFileTransfer> = Vec::new();
        let mut seen = HashSet::new();
        for answer in answers.iter().filter(|a| !a.is_forbidden) {
            if !seen.insert(answer.hash.clone()) {
                continue;
            }
            match self.inner.cache.get_by_hash(&answer.hash) {
                Some(entry) => uploads.push(
                    UploadFileTransfer::new(answer.clone(), server, entry.size)
                        .with_local_file(entry.resolved_path),
                ),
                None => warn!(hash = %answer.hash, "Requested file is no longer in the local cache"),
            }
        }
        self.inner.current.insert(server, uploads.clone());

        for answer in answers.iter().filter(|a| a.is_forbidden) {
            let mut transfer = UploadFileTransfer::new(answer.clone(), server, 0);
            transfer.local_file = self
                .inner
                .cache
                .get_by_hash(&answer.hash)
                .map(|e| e.resolved_path);
            self.inner.orchestrator.add_forbidden(transfer);
            self.mark_verified(server, &answer.hash);
        }

        let raw_size: u64 = uploads.iter().map(|u| u.total()).sum();
        debug!(server = %server, files = uploads.len(), raw_size, "Compressing and uploading files");

        let mut in_flight: Option<JoinHandle<()>> = None;
        for transfer in uploads
            .iter()
            .filter(|t| t.can_be_transferred() && !t.is_transferred())
        {
            debug!(hash = %transfer.hash(), "Compressing");
            let data = match self
                .inner
                .cache
                .get_compressed_data(transfer.hash(), token)
                .await
            {
                Ok(data) => data,
                Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e) => {
                    warn!(hash = %transfer.hash(), error = %e, "Could not read file; skipping");
                    continue;
                }
            };
            transfer.set_total(data.len() as u64);

            if let Some(previous) = in_flight.take() {
                let _ = previous.await;
            }
            in_flight = Some(tokio::spawn(self.clone().upload_file(
                server,
                data,
                transfer.clone(),
                token.clone(),
            )));
            if token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
        }

        if let Some(last) = in_flight {
            let _ = last.await;
            let compressed: u64 = uploads.iter().map(|u| u.total()).sum();
            debug!(server = %server, raw_size, compressed, "Uploads finished");
        }
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let uploaded: HashSet<&str> = uploads.iter().map(|u| u.hash()).collect();
        for hash in local.iter().filter(|h| !uploaded.contains(h.as_str())) {
            self.mark_verified(server, hash);
        }
        Ok(())
    }

    async fn files_send(
        &self,
        server: ServerId,
        hashes: &[String],
        uids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadFileDto>> {
        let cdn = self.inner.orchestrator.require_cdn_uri(server)?;
        let uri = routes::files_send(&cdn);
        let dto = FilesSendDto {
            file_hashes: hashes.to_vec(),
            uids: uids.to_vec(),
        };
        let response = self
            .inner
            .orchestrator
            .send_request(
                server,
                Method::POST,
                &uri,
                RequestBody::Json(serde_json::to_value(&dto)?),
                Some(cancel),
            )
            .await?;
        let response = check_status(response, &uri)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            answers = response.json::<Vec<UploadFileDto>>() => Ok(answers?),
        }
    }

    /// Upload one file, falling back to the munged endpoint once on any
    /// non-cancellation failure. Never fails: problems are logged and the
    /// file is left unverified.
    async fn upload_file(
        self,
        server: ServerId,
        data: Bytes,
        transfer: UploadFileTransfer,
        token: CancellationToken,
    ) {
        let hash = transfer.hash().to_string();
        info!(server = %server, hash = %hash, size = data.len(), "Uploading");
        if token.is_cancelled() {
            return;
        }

        let alternative = self.inner.orchestrator.settings().use_alternative_upload;
        match self
            .upload_stream(server, data.clone(), &transfer, alternative, &token)
            .await
        {
            Ok(()) => self.mark_verified(server, &hash),
            Err(TransferError::Cancelled) => {
                warn!(hash = %hash, "File upload cancelled");
            }
            Err(e) if !alternative => {
                warn!(hash = %hash, error = %e, "Upload failed; trying alternative upload");
                match self
                    .upload_stream(server, data, &transfer, true, &token)
                    .await
                {
                    Ok(()) => self.mark_verified(server, &hash),
                    Err(e) => warn!(hash = %hash, error = %e, "Alternative upload failed"),
                }
            }
            Err(e) => warn!(hash = %hash, error = %e, "Upload failed"),
        }
    }

    async fn upload_stream(
        &self,
        server: ServerId,
        data: Bytes,
        transfer: &UploadFileTransfer,
        munge: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        let cdn = self.inner.orchestrator.require_cdn_uri(server)?;
        let (uri, payload) = if munge {
            (routes::files_upload_munged(&cdn, transfer.hash()), munged(&data))
        } else {
            (routes::files_upload(&cdn, transfer.hash()), data)
        };

        transfer.set_transferred(0);
        let length = payload.len() as u64;
        let body = progress_body(payload, transfer.progress_counter());
        let response = self
            .inner
            .orchestrator
            .send_request(
                server,
                Method::POST,
                &uri,
                RequestBody::Stream { body, length },
                Some(token),
            )
            .await?;
        debug!(hash = %transfer.hash(), status = %response.status(), "Upload status");
        check_status(response, &uri)?;
        Ok(())
    }
}

/// Chunked body that advances `counter` as chunks are handed to the
/// transport.
fn progress_body(payload: Bytes, counter: Arc<AtomicU64>) -> reqwest::Body {
    let chunks: Vec<Bytes> = (0..payload.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| payload.slice(start..(start + UPLOAD_CHUNK_SIZE).min(payload.len())))
        .collect();
    let stream = stream::iter(chunks.into_iter().map(move |chunk| {
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok::<Bytes, std::io::Error>(chunk)
    }));
    reqwest::Body::wrap_stream(stream)
}

fn check_status(response: reqwest::Response, uri: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(TransferError::Status {
            status: response.status().as_u16(),
            uri: uri.to_string(),
        })
    }
}
