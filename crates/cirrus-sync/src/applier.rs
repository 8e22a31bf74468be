//! Local filesystem applier (secondary/driven adapter)
//!
//! Implements [`IFilesystemApplier`] with `tokio::fs`. File contents are
//! fetched from the remote service by storage key.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: content goes to `<target>` + [`TEMP_SUFFIX`] and is
//!   renamed into place, so a crash never leaves a half-written file.
//! - **Idempotent**: every operation first checks whether its effect is
//!   already on disk. Re-applying an event after a crash is a no-op.
//! - **Integrity**: downloaded content must hash to the event's hash.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use cirrus_core::domain::{ChangeKind, FileMetadata, ServerEvent};
use cirrus_core::ports::{IFilesystemApplier, IRemoteService};
use tracing::{debug, instrument};

use crate::hashing::{hash_bytes, hash_file};

/// Suffix of the temporary files used for atomic writes
///
/// The watcher ingestor ignores paths ending with it.
pub const TEMP_SUFFIX: &str = ".cirrus-tmp";

/// Applies server events under a sync root
pub struct LocalFilesystemApplier {
    root: PathBuf,
    remote: Arc<dyn IRemoteService>,
}

impl LocalFilesystemApplier {
    pub fn new(root: PathBuf, remote: Arc<dyn IRemoteService>) -> Self {
        Self { root, remote }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Makes `target` hold the content described by `metadata`
    async fn materialize(&self, target: &Path, metadata: &FileMetadata) -> anyhow::Result<()> {
        if let Some(expected) = &metadata.hash {
            if is_file(target).await && hash_file(target).await.ok().as_ref() == Some(expected) {
                debug!(path = %target.display(), "content already present");
                return Ok(());
            }
        }

        let key = metadata
            .storage_key
            .as_ref()
            .ok_or_else(|| anyhow!("No storage key for {}", target.display()))?;
        let data = self
            .remote
            .fetch_content(key)
            .await
            .with_context(|| format!("Failed to fetch content for {}", target.display()))?;

        if let Some(expected) = &metadata.hash {
            let actual = hash_bytes(&data);
            if &actual != expected {
                bail!(
                    "Downloaded content for {} hashes to {actual}, expected {expected}",
                    target.display()
                );
            }
        }

        write_atomic(target, &data).await
    }

    async fn apply_rename(&self, event: &ServerEvent, target: &Path) -> anyhow::Result<()> {
        let source = event
            .from_path
            .as_ref()
            .ok_or_else(|| anyhow!("Rename event for {} has no source path", event.path))?
            .to_local(&self.root);

        if tokio::fs::symlink_metadata(&source).await.is_ok() {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!(from = %source.display(), to = %target.display(), "moving");
            tokio::fs::rename(&source, target).await?;
        } else {
            debug!(from = %source.display(), "rename source already gone");
        }

        if event.metadata.is_folder {
            tokio::fs::create_dir_all(target).await?;
            Ok(())
        } else {
            self.materialize(target, &event.metadata).await
        }
    }
}

#[async_trait::async_trait]
impl IFilesystemApplier for LocalFilesystemApplier {
    #[instrument(skip(self, event), fields(kind = %event.kind, path = %event.path))]
    async fn apply(&self, event: &ServerEvent) -> anyhow::Result<()> {
        let target = event.path.to_local(&self.root);

        match event.kind {
            ChangeKind::Created | ChangeKind::Modified if event.metadata.is_folder => {
                tokio::fs::create_dir_all(&target).await?;
            }
            ChangeKind::Created | ChangeKind::Modified => {
                self.materialize(&target, &event.metadata).await?;
            }
            ChangeKind::Deleted => remove_path(&target).await?,
            ChangeKind::Renamed => self.apply_rename(event, &target).await?,
        }

        debug!("event applied");
        Ok(())
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Writes through a temporary sibling and renames it over the target
async fn write_atomic(target: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = {
        let mut p = target.as_os_str().to_owned();
        p.push(TEMP_SUFFIX);
        PathBuf::from(p)
    };

    debug!(?tmp_path, bytes = data.len(), "writing to temporary file");
    tokio::fs::write(&tmp_path, data).await?;
    tokio::fs::rename(&tmp_path, target).await?;
    Ok(())
}

/// Removes a file or a directory tree; a missing path is not an error
async fn remove_path(path: &Path) -> anyhow::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "already deleted");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Utc;
    use cirrus_core::domain::{EventId, RelativePath, StorageKey, SyncId};
    use cirrus_core::ports::{
        MetadataQuery, PullRequest, PullResponse, PushRequest, PushResponse,
    };
    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct ContentStore {
        blobs: HashMap<String, Vec<u8>>,
        fetches: Mutex<u32>,
    }

    impl ContentStore {
        fn with(key: &str, data: &[u8]) -> Self {
            let mut store = Self::default();
            store.blobs.insert(key.to_string(), data.to_vec());
            store
        }

        fn fetches(&self) -> u32 {
            *self.fetches.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl IRemoteService for ContentStore {
        async fn push(&self, _request: &PushRequest) -> anyhow::Result<PushResponse> {
            bail!("push not used by the applier")
        }

        async fn pull(&self, _request: &PullRequest) -> anyhow::Result<PullResponse> {
            bail!("pull not used by the applier")
        }

        async fn query_metadata(
            &self,
            _query: &MetadataQuery,
        ) -> anyhow::Result<Option<FileMetadata>> {
            Ok(None)
        }

        async fn fetch_content(&self, key: &StorageKey) -> anyhow::Result<Vec<u8>> {
            *self.fetches.lock().unwrap() += 1;
            self.blobs
                .get(key.as_str())
                .cloned()
                .ok_or_else(|| anyhow!("no blob {key}"))
        }
    }

    fn file_event(kind: ChangeKind, path: &str, key: &str, data: &[u8]) -> ServerEvent {
        ServerEvent {
            event_id: EventId::new(1),
            sync_id: SyncId::new("s1").unwrap(),
            kind,
            path: RelativePath::new(path).unwrap(),
            from_path: None,
            metadata: FileMetadata::file(hash_bytes(data), data.len() as u64, Utc::now())
                .with_storage_key(StorageKey::new(key).unwrap()),
            origin_client: None,
            origin_change_id: None,
        }
    }

    fn setup(store: ContentStore) -> (TempDir, Arc<ContentStore>, LocalFilesystemApplier) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store);
        let applier = LocalFilesystemApplier::new(dir.path().to_path_buf(), store.clone());
        (dir, store, applier)
    }

    #[tokio::test]
    async fn created_file_is_downloaded_into_place() {
        let (dir, store, applier) = setup(ContentStore::with("k1", b"hello"));
        let event = file_event(ChangeKind::Created, "/docs/a.txt", "k1", b"hello");

        applier.apply(&event).await.unwrap();

        let written = tokio::fs::read(dir.path().join("docs/a.txt")).await.unwrap();
        assert_eq!(written, b"hello");
        assert!(!dir.path().join("docs/a.txt.cirrus-tmp").exists());
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn reapplying_matching_content_skips_download() {
        let (_dir, store, applier) = setup(ContentStore::with("k1", b"hello"));
        let event = file_event(ChangeKind::Created, "/a.txt", "k1", b"hello");

        applier.apply(&event).await.unwrap();
        applier.apply(&event).await.unwrap();

        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn corrupt_download_is_refused() {
        let (dir, _store, applier) = setup(ContentStore::with("k1", b"tampered"));
        let event = file_event(ChangeKind::Modified, "/a.txt", "k1", b"original");

        assert!(applier.apply(&event).await.is_err());
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn folder_events_create_directories() {
        let (dir, _store, applier) = setup(ContentStore::default());
        let mut event = file_event(ChangeKind::Created, "/photos/2024", "unused", b"");
        event.metadata = FileMetadata::folder(Utc::now());

        applier.apply(&event).await.unwrap();
        applier.apply(&event).await.unwrap();

        assert!(dir.path().join("photos/2024").is_dir());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (dir, _store, applier) = setup(ContentStore::default());
        std::fs::create_dir_all(dir.path().join("old/nested")).unwrap();
        std::fs::write(dir.path().join("old/nested/f.txt"), b"x").unwrap();

        let mut event = file_event(ChangeKind::Deleted, "/old", "unused", b"");
        event.metadata = FileMetadata::folder(Utc::now());

        applier.apply(&event).await.unwrap();
        assert!(!dir.path().join("old").exists());
        applier.apply(&event).await.unwrap();
    }

    #[tokio::test]
    async fn rename_moves_existing_file() {
        let (dir, store, applier) = setup(ContentStore::default());
        std::fs::write(dir.path().join("b.txt"), b"body").unwrap();

        let mut event = file_event(ChangeKind::Renamed, "/sub/c.txt", "k1", b"body");
        event.from_path = Some(RelativePath::new("/b.txt").unwrap());

        applier.apply(&event).await.unwrap();
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("sub/c.txt")).unwrap(), b"body");

        // Source gone, destination in place
        applier.apply(&event).await.unwrap();
        assert_eq!(store.fetches(), 0);
    }

    #[tokio::test]
    async fn rename_without_local_source_downloads_destination() {
        let (dir, store, applier) = setup(ContentStore::with("k1", b"body"));
        let mut event = file_event(ChangeKind::Renamed, "/c.txt", "k1", b"body");
        event.from_path = Some(RelativePath::new("/never-synced.txt").unwrap());

        applier.apply(&event).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("c.txt")).unwrap(), b"body");
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn missing_storage_key_is_an_error() {
        let (_dir, _store, applier) = setup(ContentStore::default());
        let mut event = file_event(ChangeKind::Created, "/a.txt", "k1", b"data");
        event.metadata.storage_key = None;

        assert!(applier.apply(&event).await.is_err());
    }
}
