//! Integration tests for turning filesystem events into queued changes

mod common;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use cirrus_core::domain::{ChangeKind, FailureSet, FileChange, StorageKey};
use cirrus_core::ports::{EventOrigin, ILocalIndex};
use cirrus_sync::applier::TEMP_SUFFIX;
use cirrus_sync::watcher::{ChangeIngestor, WatchEvent};
use cirrus_sync::worker::SyncTrigger;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::*;

struct Fixture {
    dir: TempDir,
    harness: Harness,
    trigger: SyncTrigger,
    ingestor: ChangeIngestor,
}

impl Fixture {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new().await;
        let trigger = SyncTrigger::new();
        let ingestor = ChangeIngestor::new(harness.ctx(), dir.path().to_path_buf(), trigger.clone());
        Self {
            dir,
            harness,
            trigger,
            ingestor,
        }
    }

    fn local(&self, rel: &str) -> std::path::PathBuf {
        self.dir.path().join(rel.trim_start_matches('/'))
    }

    fn write(&self, rel: &str, content: &[u8]) -> std::path::PathBuf {
        let local = self.local(rel);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&local, content).unwrap();
        local
    }

    fn queued(&self) -> Vec<FileChange> {
        self.harness
            .ctx()
            .queue
            .drain(&mut FailureSet::new(), Utc::now())
    }
}

fn kinds(changes: &[FileChange]) -> Vec<(ChangeKind, String)> {
    changes
        .iter()
        .map(|c| (c.kind(), c.path().to_string()))
        .collect()
}

#[tokio::test]
async fn new_file_is_created_then_modified() {
    let mut f = Fixture::new().await;
    let local = f.write("/notes.txt", b"v1");
    f.ingestor.ingest(WatchEvent::Created(local.clone())).await.unwrap();

    f.write("/notes.txt", b"v2");
    f.ingestor.ingest(WatchEvent::Modified(local.clone())).await.unwrap();

    // Same bytes again
    let ids = f.ingestor.ingest(WatchEvent::Modified(local)).await.unwrap();
    assert!(ids.is_empty());

    let queued = f.queued();
    assert_eq!(
        kinds(&queued),
        vec![
            (ChangeKind::Created, "/notes.txt".to_string()),
            (ChangeKind::Modified, "/notes.txt".to_string()),
        ]
    );
    assert_eq!(queued[1].metadata().size, 2);
    assert!(!queued[1].is_folder());
}

#[tokio::test]
async fn folders_carry_folder_metadata() {
    let mut f = Fixture::new().await;
    let local = f.local("/photos");
    std::fs::create_dir(&local).unwrap();

    f.ingestor.ingest(WatchEvent::Created(local)).await.unwrap();

    let queued = f.queued();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].is_folder());
    assert!(queued[0].metadata().hash.is_none());
}

#[tokio::test]
async fn ingest_requests_a_sync() {
    let mut f = Fixture::new().await;
    let local = f.write("/a.txt", b"a");

    f.ingestor.ingest(WatchEvent::Created(local)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), f.trigger.notified())
        .await
        .expect("ingest should request a sync");
}

#[tokio::test]
async fn engine_writes_and_temp_files_are_ignored() {
    let mut f = Fixture::new().await;
    let partial = f.write(&format!("/download.bin{TEMP_SUFFIX}"), b"half");
    let echoed = f.write("/from-server.txt", b"server");
    f.harness.ctx().echo.register(&path("/from-server.txt"));

    assert!(f.ingestor.ingest(WatchEvent::Created(partial)).await.unwrap().is_empty());
    assert!(f.ingestor.ingest(WatchEvent::Created(echoed)).await.unwrap().is_empty());
    assert!(f.harness.ctx().queue.is_empty());
}

#[tokio::test]
async fn paths_outside_the_root_are_ignored() {
    let mut f = Fixture::new().await;
    let elsewhere = TempDir::new().unwrap();
    let stray = elsewhere.path().join("stray.txt");
    std::fs::write(&stray, b"x").unwrap();

    assert!(f.ingestor.ingest(WatchEvent::Created(stray)).await.unwrap().is_empty());
    assert!(f
        .ingestor
        .ingest(WatchEvent::Modified(f.dir.path().to_path_buf()))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn deleting_an_unknown_path_is_ignored() {
    let mut f = Fixture::new().await;
    let ids = f
        .ingestor
        .ingest(WatchEvent::Deleted(f.local("/never-seen.txt")))
        .await
        .unwrap();
    assert!(ids.is_empty());
}

#[tokio::test]
async fn created_then_deleted_emits_delete_with_metadata() {
    let mut f = Fixture::new().await;
    let local = f.write("/tmp.txt", b"scratch");
    f.ingestor.ingest(WatchEvent::Created(local.clone())).await.unwrap();

    std::fs::remove_file(&local).unwrap();
    f.ingestor.ingest(WatchEvent::Deleted(local.clone())).await.unwrap();

    let queued = f.queued();
    assert_eq!(queued[1].kind(), ChangeKind::Deleted);
    assert_eq!(queued[1].metadata().size, 7);

    // Forgotten after the delete
    assert!(f.ingestor.ingest(WatchEvent::Deleted(local)).await.unwrap().is_empty());
}

#[tokio::test]
async fn modify_of_missing_path_becomes_delete() {
    let mut f = Fixture::new().await;
    let local = f.write("/flicker.txt", b"f");
    f.ingestor.ingest(WatchEvent::Created(local.clone())).await.unwrap();
    std::fs::remove_file(&local).unwrap();

    f.ingestor.ingest(WatchEvent::Modified(local)).await.unwrap();

    let queued = f.queued();
    assert_eq!(queued.last().unwrap().kind(), ChangeKind::Deleted);
}

#[tokio::test]
async fn edits_to_synced_files_carry_their_base_revision() {
    let mut f = Fixture::new().await;
    let mut event = foreign_event(1, ChangeKind::Created, "/report.pdf", b"server copy");
    event.metadata = event.metadata.with_revision(3);
    f.harness
        .index
        .apply_server_event(&event, EventOrigin::Remote)
        .await
        .unwrap();

    let local = f.write("/report.pdf", b"local edit");
    f.ingestor.ingest(WatchEvent::Modified(local)).await.unwrap();

    let queued = f.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind(), ChangeKind::Modified);
    assert_eq!(queued[0].metadata().revision, 3);
    assert_eq!(
        queued[0].metadata().storage_key,
        Some(StorageKey::new("blob-1").unwrap())
    );
}

#[tokio::test]
async fn rename_of_known_file_is_a_single_change() {
    let mut f = Fixture::new().await;
    let old = f.write("/draft.txt", b"text");
    f.ingestor.ingest(WatchEvent::Created(old.clone())).await.unwrap();

    let new = f.local("/final.txt");
    std::fs::rename(&old, &new).unwrap();
    f.ingestor
        .ingest(WatchEvent::Renamed {
            old,
            new: new.clone(),
        })
        .await
        .unwrap();

    let queued = f.queued();
    let rename = &queued[1];
    assert_eq!(rename.kind(), ChangeKind::Renamed);
    assert_eq!(rename.from_path(), Some(&path("/draft.txt")));
    assert_eq!(rename.path(), &path("/final.txt"));

    // The new name is now the known one
    f.write("/final.txt", b"text v2");
    f.ingestor.ingest(WatchEvent::Modified(new)).await.unwrap();
    assert_eq!(f.queued()[0].kind(), ChangeKind::Modified);
}

#[tokio::test]
async fn rename_of_unknown_source_is_a_create() {
    let mut f = Fixture::new().await;
    let new = f.write("/moved-in.txt", b"m");

    f.ingestor
        .ingest(WatchEvent::Renamed {
            old: f.local("/nowhere.txt"),
            new,
        })
        .await
        .unwrap();

    assert_eq!(f.queued()[0].kind(), ChangeKind::Created);
}

#[tokio::test]
async fn run_pairs_move_halves_from_the_channel() {
    let f = Fixture::new().await;
    let old = f.write("/before.txt", b"b");
    let new = f.local("/after.txt");

    let Fixture {
        dir,
        harness,
        ingestor,
        ..
    } = f;
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(rx, cancel.clone()));

    tx.send(WatchEvent::Created(old.clone())).await.unwrap();
    std::fs::rename(&old, &new).unwrap();
    tx.send(WatchEvent::MovedFrom(old)).await.unwrap();
    tx.send(WatchEvent::MovedTo(new)).await.unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("ingestor should stop when the channel closes")
        .unwrap();

    let queued = harness.ctx().queue.drain(&mut FailureSet::new(), Utc::now());
    assert_eq!(
        kinds(&queued),
        vec![
            (ChangeKind::Created, "/before.txt".to_string()),
            (ChangeKind::Renamed, "/after.txt".to_string()),
        ]
    );
    assert!(Path::new(dir.path()).join("after.txt").exists());
}
