//! Shared fixtures for the sync integration tests
//!
//! An in-memory sync server, a recording filesystem applier and an index
//! wrapper that can be told to fail.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cirrus_core::domain::{
    ChangeId, ChangeKind, ClientId, EventId, FileChange, FileMetadata, IndexRecord, RelativePath,
    ServerEvent, StorageKey, SyncCursor, SyncId,
};
use cirrus_core::ports::{
    DeferredEvent, EventOrigin, IFilesystemApplier, ILocalIndex, IRemoteService, MergeOutcome, MetadataQuery,
    PullRequest, PullResponse, PushRequest, PushResponse, RejectedChange, RemoteError,
};
use cirrus_index::{DatabasePool, SqliteLocalIndex};
use cirrus_sync::backoff::Backoff;
use cirrus_sync::engine::{EngineContext, EngineSettings, SyncEngine};
use cirrus_sync::hashing::hash_bytes;

pub const ROOT: &str = "/home/user/Cirrus";

pub fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn path(s: &str) -> RelativePath {
    RelativePath::new(s).unwrap()
}

pub fn file_meta(content: &[u8]) -> FileMetadata {
    FileMetadata::file(hash_bytes(content), content.len() as u64, ts())
}

pub fn folder_meta() -> FileMetadata {
    FileMetadata::folder(ts())
}

pub fn created_folder(p: &str) -> FileChange {
    FileChange::new(ChangeKind::Created, path(p), folder_meta())
}

pub fn created_file(p: &str, content: &[u8]) -> FileChange {
    FileChange::new(ChangeKind::Created, path(p), file_meta(content))
}

pub fn modified_file(p: &str, content: &[u8]) -> FileChange {
    FileChange::new(ChangeKind::Modified, path(p), file_meta(content))
}

pub fn deleted_file(p: &str, content: &[u8]) -> FileChange {
    FileChange::new(ChangeKind::Deleted, path(p), file_meta(content))
}

pub fn renamed_file(from: &str, to: &str, content: &[u8]) -> FileChange {
    FileChange::renamed(path(from), path(to), file_meta(content))
}

pub fn sync_id(s: &str) -> SyncId {
    SyncId::new(s).unwrap()
}

/// A change made on another client
pub fn foreign_event(event_id: i64, kind: ChangeKind, p: &str, content: &[u8]) -> ServerEvent {
    ServerEvent {
        event_id: EventId::new(event_id),
        sync_id: sync_id("remote"),
        kind,
        path: path(p),
        from_path: None,
        metadata: file_meta(content)
            .with_revision(1)
            .with_storage_key(StorageKey::new(format!("blob-{event_id}")).unwrap()),
        origin_client: Some(ClientId::new()),
        origin_change_id: Some(ChangeId::new(900 + event_id as u64)),
    }
}

// ============================================================================
// FakeServer
// ============================================================================

#[derive(Default)]
struct ServerState {
    next_event: i64,
    next_sync: u64,
    current_sync: Option<SyncId>,
    revisions: HashMap<RelativePath, u64>,
    pushes: Vec<PushRequest>,
    pulls: Vec<PullRequest>,
    incoming: Vec<ServerEvent>,
    pull_script: VecDeque<PullResponse>,
    reject_paths: HashSet<RelativePath>,
    fail_next_push: Option<RemoteError>,
    pending_count: Option<u64>,
}

impl ServerState {
    fn bump_sync(&mut self) -> SyncId {
        self.next_sync += 1;
        let id = sync_id(&format!("s{}", self.next_sync));
        self.current_sync = Some(id.clone());
        id
    }

    fn settle_sync(&mut self) -> SyncId {
        match &self.current_sync {
            Some(id) if self.incoming.is_empty() => id.clone(),
            _ => self.bump_sync(),
        }
    }
}

/// In-memory sync server
///
/// Acknowledges every pushed change with a new revision, except those on
/// paths marked for rejection, and hands out foreign events queued with
/// [`FakeServer::announce`].
pub struct FakeServer {
    state: Mutex<ServerState>,
    hang_pulls: AtomicBool,
    hang_pushes: AtomicBool,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                next_event: 100,
                ..ServerState::default()
            }),
            hang_pulls: AtomicBool::new(false),
            hang_pushes: AtomicBool::new(false),
        }
    }

    /// Queues a foreign event for the next exchange
    pub fn announce(&self, event: ServerEvent) {
        self.state.lock().unwrap().incoming.push(event);
    }

    /// Scripts the next pull response
    pub fn script_pull(&self, response: PullResponse) {
        self.state.lock().unwrap().pull_script.push_back(response);
    }

    pub fn reject(&self, p: &str) {
        self.state.lock().unwrap().reject_paths.insert(path(p));
    }

    pub fn fail_next_push(&self, error: RemoteError) {
        self.state.lock().unwrap().fail_next_push = Some(error);
    }

    pub fn report_pending(&self, count: u64) {
        self.state.lock().unwrap().pending_count = Some(count);
    }

    pub fn hang_pulls(&self, hang: bool) {
        self.hang_pulls.store(hang, Ordering::SeqCst);
    }

    pub fn hang_pushes(&self, hang: bool) {
        self.hang_pushes.store(hang, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> Vec<PushRequest> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn pulls(&self) -> Vec<PullRequest> {
        self.state.lock().unwrap().pulls.clone()
    }
}

#[async_trait::async_trait]
impl IRemoteService for FakeServer {
    async fn push(&self, request: &PushRequest) -> anyhow::Result<PushResponse> {
        if self.hang_pushes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        state.pushes.push(request.clone());
        if let Some(error) = state.fail_next_push.take() {
            return Err(error.into());
        }

        let sync_id = state.bump_sync();
        let mut events = Vec::new();
        let mut rejected = Vec::new();

        for change in &request.events {
            if state.reject_paths.contains(&change.path) {
                rejected.push(RejectedChange {
                    change_id: change.change_id,
                    reason: "quota exceeded".into(),
                });
                continue;
            }
            state.next_event += 1;
            let event_id = state.next_event;
            let revision = {
                let rev = state.revisions.entry(change.path.clone()).or_insert(0);
                *rev += 1;
                *rev
            };
            let mut metadata = change.metadata.clone().with_revision(revision);
            if !metadata.is_folder {
                metadata.storage_key = Some(StorageKey::new(format!("blob-{event_id}")).unwrap());
            }
            events.push(ServerEvent {
                event_id: EventId::new(event_id),
                sync_id: sync_id.clone(),
                kind: change.kind,
                path: change.path.clone(),
                from_path: change.from_path.clone(),
                metadata,
                origin_client: Some(request.client_id),
                origin_change_id: Some(change.change_id),
            });
        }
        events.append(&mut state.incoming);

        Ok(PushResponse {
            sync_id,
            events,
            pending_count: state.pending_count.take(),
            partial: false,
            rejected,
        })
    }

    async fn pull(&self, request: &PullRequest) -> anyhow::Result<PullResponse> {
        if self.hang_pulls.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        state.pulls.push(request.clone());
        if let Some(scripted) = state.pull_script.pop_front() {
            state.current_sync = Some(scripted.sync_id.clone());
            return Ok(scripted);
        }

        let sync_id = state.settle_sync();
        let events = std::mem::take(&mut state.incoming);
        Ok(PullResponse {
            sync_id,
            events,
            partial: false,
        })
    }

    async fn query_metadata(&self, _query: &MetadataQuery) -> anyhow::Result<Option<FileMetadata>> {
        Ok(None)
    }

    async fn fetch_content(&self, key: &StorageKey) -> anyhow::Result<Vec<u8>> {
        Err(RemoteError::NotFound(key.to_string()).into())
    }
}

// ============================================================================
// RecordingApplier
// ============================================================================

/// Records applied events; fails for paths marked with [`fail_on`](Self::fail_on)
#[derive(Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<ServerEvent>>,
    failing: Mutex<HashSet<RelativePath>>,
}

impl RecordingApplier {
    pub fn fail_on(&self, p: &str) {
        self.failing.lock().unwrap().insert(path(p));
    }

    /// Lets writes to `p` succeed again
    pub fn heal(&self, p: &str) {
        self.failing.lock().unwrap().remove(&path(p));
    }

    pub fn applied(&self) -> Vec<ServerEvent> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl IFilesystemApplier for RecordingApplier {
    async fn apply(&self, event: &ServerEvent) -> anyhow::Result<()> {
        if self.failing.lock().unwrap().contains(&event.path) {
            anyhow::bail!("disk full writing {}", event.path);
        }
        self.applied.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// FlakyIndex
// ============================================================================

/// Delegates to the SQLite index; merges fail while `fail_merges` is set
pub struct FlakyIndex {
    pub inner: SqliteLocalIndex,
    pub fail_merges: AtomicBool,
}

#[async_trait::async_trait]
impl ILocalIndex for FlakyIndex {
    async fn merge_changes(&self, batch: &[FileChange]) -> anyhow::Result<MergeOutcome> {
        if self.fail_merges.load(Ordering::SeqCst) {
            anyhow::bail!("database disk image is malformed");
        }
        self.inner.merge_changes(batch).await
    }

    async fn complete_sync(
        &self,
        sync_id: &SyncId,
        completed: &[ChangeId],
        new_root: Option<&Path>,
    ) -> anyhow::Result<u64> {
        self.inner.complete_sync(sync_id, completed, new_root).await
    }

    async fn mark_event_completed_on_previous_sync(&self, event_id: EventId) -> anyhow::Result<()> {
        self.inner.mark_event_completed_on_previous_sync(event_id).await
    }

    async fn apply_server_event(&self, event: &ServerEvent, origin: EventOrigin) -> anyhow::Result<()> {
        self.inner.apply_server_event(event, origin).await
    }

    async fn defer_event(&self, event: &ServerEvent, reason: &str) -> anyhow::Result<()> {
        self.inner.defer_event(event, reason).await
    }

    async fn deferred_events(&self) -> anyhow::Result<Vec<DeferredEvent>> {
        self.inner.deferred_events().await
    }

    async fn is_event_applied(&self, event_id: EventId) -> anyhow::Result<bool> {
        self.inner.is_event_applied(event_id).await
    }

    async fn lookup_metadata(
        &self,
        path: &RelativePath,
        revision: u64,
    ) -> anyhow::Result<Option<FileMetadata>> {
        self.inner.lookup_metadata(path, revision).await
    }

    async fn get_record(&self, path: &RelativePath) -> anyhow::Result<Option<IndexRecord>> {
        self.inner.get_record(path).await
    }

    async fn records_under(&self, path: &RelativePath) -> anyhow::Result<Vec<IndexRecord>> {
        self.inner.records_under(path).await
    }

    async fn cursor(&self) -> anyhow::Result<SyncCursor> {
        self.inner.cursor().await
    }

    async fn pending_records(&self) -> anyhow::Result<Vec<FileChange>> {
        self.inner.pending_records().await
    }

    async fn max_change_id(&self) -> anyhow::Result<Option<ChangeId>> {
        self.inner.max_change_id().await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn settings() -> EngineSettings {
    EngineSettings {
        relative_root_path: "/".into(),
        user_id: "tester".into(),
        network_timeout: Duration::from_secs(5),
        max_batch_size: 100,
        backoff: Backoff::new(Duration::ZERO, Duration::ZERO, false),
    }
}

pub async fn sqlite_index() -> SqliteLocalIndex {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    SqliteLocalIndex::new(pool.pool().clone(), PathBuf::from(ROOT))
}

pub struct Harness {
    pub client_id: ClientId,
    pub index: Arc<FlakyIndex>,
    pub server: Arc<FakeServer>,
    pub applier: Arc<RecordingApplier>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(settings()).await
    }

    pub async fn with_settings(settings: EngineSettings) -> Self {
        let index = Arc::new(FlakyIndex {
            inner: sqlite_index().await,
            fail_merges: AtomicBool::new(false),
        });
        let server = Arc::new(FakeServer::new());
        let applier = Arc::new(RecordingApplier::default());
        let client_id = ClientId::new();
        let engine = build_engine(client_id, settings, index.clone(), server.clone(), applier.clone()).await;
        Self {
            client_id,
            index,
            server,
            applier,
            engine,
        }
    }

    /// A fresh engine over the same durable state, as after a restart
    pub async fn restart(&self) -> Arc<SyncEngine> {
        build_engine(
            self.client_id,
            settings(),
            self.index.clone(),
            self.server.clone(),
            self.applier.clone(),
        )
        .await
    }

    pub fn ctx(&self) -> &EngineContext {
        self.engine.context()
    }

    pub fn enqueue(&self, changes: Vec<FileChange>) -> Vec<ChangeId> {
        self.ctx().queue.enqueue(changes, false)
    }
}

async fn build_engine(
    client_id: ClientId,
    settings: EngineSettings,
    index: Arc<FlakyIndex>,
    server: Arc<FakeServer>,
    applier: Arc<RecordingApplier>,
) -> Arc<SyncEngine> {
    let ctx = EngineContext::new(client_id, settings, index, server, applier)
        .await
        .expect("context");
    Arc::new(SyncEngine::new(ctx))
}
