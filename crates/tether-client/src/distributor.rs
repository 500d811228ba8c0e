//! Fan-out of the local snapshot to visible peers on every server.
//!
//! Targets are `(peer, server)` pairs collected into one pending set.
//! Each server with pending targets gets an upload of the latest snapshot
//! (at most one in flight per server, shared between triggers) followed by
//! a single push carrying every pending peer for that server.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use tether_files::{TransferError, UploadManager};
use tether_shared::{
    CharacterData, DataHash, EventBus, ServerId, ServerUserKey, SyncEvent, UserData,
};

use crate::error::Result;

/// Who is currently visible, per server.
pub trait VisiblePeers: Send + Sync {
    fn visible_on(&self, server: ServerId) -> Vec<UserData>;

    fn visible_everywhere(&self) -> Vec<ServerUserKey>;
}

/// Makes sure a snapshot's files exist on a server and returns the
/// snapshot that may be distributed there.
#[async_trait]
pub trait SnapshotUploader: Send + Sync {
    async fn upload(
        &self,
        server: ServerId,
        data: &CharacterData,
        visible: &[UserData],
    ) -> std::result::Result<CharacterData, TransferError>;
}

#[async_trait]
pub trait SnapshotPusher: Send + Sync {
    async fn push(&self, server: ServerId, data: &CharacterData, recipients: &[UserData])
        -> Result<()>;

    fn any_connected(&self) -> bool;
}

#[async_trait]
impl SnapshotUploader for UploadManager {
    async fn upload(
        &self,
        server: ServerId,
        data: &CharacterData,
        visible: &[UserData],
    ) -> std::result::Result<CharacterData, TransferError> {
        self.upload_character_data(server, data, visible).await
    }
}

/// In-memory [`VisiblePeers`] fed by whatever tracks proximity.
#[derive(Debug, Default)]
pub struct VisiblePeerSet {
    peers: DashMap<ServerId, Vec<UserData>>,
}

impl VisiblePeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_visible(&self, server: ServerId, peers: Vec<UserData>) {
        self.peers.insert(server, peers);
    }

    pub fn add(&self, server: ServerId, peer: UserData) {
        let mut peers = self.peers.entry(server).or_default();
        if !peers.iter().any(|p| p.uid == peer.uid) {
            peers.push(peer);
        }
    }

    pub fn remove(&self, server: ServerId, uid: &str) {
        if let Some(mut peers) = self.peers.get_mut(&server) {
            peers.retain(|p| p.uid != uid);
        }
    }

    pub fn clear_server(&self, server: ServerId) {
        self.peers.remove(&server);
    }
}

impl VisiblePeers for VisiblePeerSet {
    fn visible_on(&self, server: ServerId) -> Vec<UserData> {
        self.peers
            .get(&server)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn visible_everywhere(&self) -> Vec<ServerUserKey> {
        self.peers
            .iter()
            .flat_map(|entry| {
                let server = *entry.key();
                entry
                    .value()
                    .iter()
                    .map(move |user| ServerUserKey::new(user.clone(), server))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

type UploadOutcome = std::result::Result<Arc<CharacterData>, Arc<TransferError>>;
type UploadTask = Shared<BoxFuture<'static, UploadOutcome>>;

struct InFlight {
    /// Snapshot the upload is for.
    hash: DataHash,
    task: UploadTask,
}

#[derive(Default)]
struct DistributorState {
    /// Latest local snapshot; the only one ever pushed.
    last_created: Option<Arc<CharacterData>>,
    /// Targets that have not received `last_created` yet.
    pending: HashSet<ServerUserKey>,
    /// Visible set at the last visibility pass.
    previously_visible: HashSet<ServerUserKey>,
    uploads: HashMap<ServerId, InFlight>,
}

impl DistributorState {
    fn pending_servers(&self) -> BTreeSet<ServerId> {
        self.pending.iter().map(|k| k.server).collect()
    }

    /// Remove and return every target pending on `server`.
    fn take_pending(&mut self, server: ServerId) -> Vec<UserData> {
        let recipients = self.pending_for(server);
        self.pending.retain(|k| k.server != server);
        recipients
    }

    fn pending_for(&self, server: ServerId) -> Vec<UserData> {
        self.pending
            .iter()
            .filter(|k| k.server == server)
            .map(|k| k.user.clone())
            .collect()
    }
}

/// Pushes the latest local snapshot to visible peers, one batched push
/// per server.
pub struct FanoutDistributor {
    peers: Arc<dyn VisiblePeers>,
    uploader: Arc<dyn SnapshotUploader>,
    pusher: Arc<dyn SnapshotPusher>,
    /// Pending targets and in-flight uploads; never held across a push.
    state: Mutex<DistributorState>,
    /// Spawned deliveries, so callers can wait for quiescence.
    tasks: TaskTracker,
    /// Fired on shutdown; deliveries not yet pushing give up.
    closing: CancellationToken,
}

impl FanoutDistributor {
    pub fn new(
        peers: Arc<dyn VisiblePeers>,
        uploader: Arc<dyn SnapshotUploader>,
        pusher: Arc<dyn SnapshotPusher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers,
            uploader,
            pusher,
            state: Mutex::new(DistributorState::default()),
            tasks: TaskTracker::new(),
            closing: CancellationToken::new(),
        })
    }

    /// A freshly built local snapshot. Identical hashes are ignored.
    pub async fn on_data_created(self: &Arc<Self>, data: Arc<CharacterData>) {
        let mut state = self.state.lock().await;
        if let Some(last) = &state.last_created {
            if last.data_hash() == data.data_hash() {
                trace!(hash = %data.data_hash(), "Data hash equal to stored data");
                return;
            }
        }
        trace!(hash = %data.data_hash(), "Storing new data hash");
        state.last_created = Some(data);
        let visible = self.peers.visible_everywhere();
        self.push_to_visible(&mut state, visible, true);
    }

    /// `server` (re)connected: everyone visible there gets the snapshot.
    pub async fn on_connected(self: &Arc<Self>, server: ServerId) {
        let mut state = self.state.lock().await;
        let visible = self
            .peers
            .visible_on(server)
            .into_iter()
            .map(|user| ServerUserKey::new(user, server))
            .collect();
        self.push_to_visible(&mut state, visible, false);
    }

    pub async fn on_disconnected(&self, server: ServerId) {
        let mut state = self.state.lock().await;
        state.previously_visible.retain(|k| k.server != server);
        state.pending.retain(|k| k.server != server);
        state.uploads.remove(&server);
    }

    /// Visibility changed somewhere: push only to the newly visible peers.
    pub async fn on_visibility_changed(self: &Arc<Self>) {
        if !self.pusher.any_connected() {
            return;
        }
        let mut state = self.state.lock().await;
        let visible: HashSet<ServerUserKey> = self.peers.visible_everywhere().into_iter().collect();
        let newly_visible: Vec<ServerUserKey> = visible
            .difference(&state.previously_visible)
            .cloned()
            .collect();
        state.previously_visible = visible;
        if newly_visible.is_empty() {
            return;
        }

        debug!(
            hash = ?state.last_created.as_ref().map(|d| d.data_hash().to_string()),
            peers = ?newly_visible.iter().map(|k| k.user.alias_or_uid()).collect::<Vec<_>>(),
            "Scheduling character data push"
        );
        state.pending.extend(newly_visible);
        for server in state.pending_servers() {
            self.schedule(&mut state, server, false);
        }
    }

    fn push_to_visible(
        self: &Arc<Self>,
        state: &mut DistributorState,
        visible: Vec<ServerUserKey>,
        forced: bool,
    ) {
        state.pending.extend(visible);
        if state.pending.is_empty() {
            return;
        }
        debug!(
            hash = ?state.last_created.as_ref().map(|d| d.data_hash().to_string()),
            count = state.pending.len(),
            "Pushing data to visible players"
        );
        for server in state.pending_servers() {
            self.schedule(state, server, forced);
        }
    }

    /// Start or reuse the upload for `server` and spawn the delivery that
    /// waits on it.
    fn schedule(self: &Arc<Self>, state: &mut DistributorState, server: ServerId, forced: bool) {
        let Some(data) = state.last_created.clone() else {
            return;
        };
        let recipients = state.pending_for(server);
        if recipients.is_empty() {
            return;
        }

        let reusable = state
            .uploads
            .get(&server)
            .filter(|f| !forced && f.hash == *data.data_hash() && f.task.peek().is_none())
            .map(|f| f.task.clone());
        let task = match reusable {
            Some(task) => task,
            None => {
                debug!(server = %server, hash = %data.data_hash(), forced, "Starting upload task");
                let uploader = self.uploader.clone();
                let snapshot = data.clone();
                let task = async move {
                    uploader
                        .upload(server, &snapshot, &recipients)
                        .await
                        .map(Arc::new)
                        .map_err(Arc::new)
                }
                .boxed()
                .shared();
                state.uploads.insert(
                    server,
                    InFlight {
                        hash: data.data_hash().clone(),
                        task: task.clone(),
                    },
                );
                task
            }
        };

        self.tasks.spawn(self.clone().deliver(server, task));
    }

    /// Wait for the upload, then push to everyone pending on `server`.
    async fn deliver(self: Arc<Self>, server: ServerId, task: UploadTask) {
        let data = match task.await {
            Ok(data) => data,
            Err(e) if e.is_cancelled() => {
                debug!(server = %server, "Upload superseded");
                return;
            }
            Err(e) => {
                warn!(server = %server, error = %e, "Upload failed; keeping targets pending");
                return;
            }
        };

        let recipients = {
            let mut state = tokio::select! {
                _ = self.closing.cancelled() => {
                    debug!(server = %server, "Distributor closing; abandoning push");
                    return;
                }
                state = self.state.lock() => state,
            };
            let current = state.last_created.as_ref().map(|d| d.data_hash());
            if current != Some(data.data_hash()) {
                debug!(server = %server, hash = %data.data_hash(), "Snapshot superseded before push");
                return;
            }
            state.take_pending(server)
        };
        if recipients.is_empty() {
            return;
        }

        debug!(
            server = %server,
            hash = %data.data_hash(),
            peers = ?recipients.iter().map(|u| u.alias_or_uid()).collect::<Vec<_>>(),
            "Pushing character data"
        );
        if let Err(e) = self.pusher.push(server, &data, &recipients).await {
            warn!(server = %server, error = %e, "Push failed; keeping targets pending");
            let mut state = self.state.lock().await;
            state.pending.extend(
                recipients
                    .into_iter()
                    .map(|user| ServerUserKey::new(user, server)),
            );
        }
    }

    /// Abandon deliveries that have not taken the push lock yet.
    pub fn close(&self) {
        self.closing.cancel();
    }

    /// Wait until every spawned delivery has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub async fn pending_targets(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Follow the bus until `cancel` fires.
    pub async fn run(self: Arc<Self>, bus: EventBus, cancel: CancellationToken) {
        let mut events = bus.subscribe();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                SyncEvent::DataChanged(data) => self.on_data_created(data).await,
                SyncEvent::Connected { server, .. } => self.on_connected(server).await,
                SyncEvent::Disconnected { server } => self.on_disconnected(server).await,
                SyncEvent::VisibilityChanged => self.on_visibility_changed().await,
                _ => {}
            }
        }
        self.close();
        self.wait_idle().await;
    }
}
