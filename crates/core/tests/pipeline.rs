use std::path::{Path, PathBuf};
use std::sync::Arc;

use mediakeep_core::fingerprint::sample_fingerprint;
use mediakeep_core::mirror::LocalDirMirror;
use mediakeep_core::model::{ItemStatus, StorageLocation};
use mediakeep_core::paths::name_hash;
use mediakeep_core::store::json::collection_doc_path;
use mediakeep_core::source::{Fault, InMemorySource, SourceProvider};
use mediakeep_core::{
    Backend, DownloadOutcome, Engine, Error, RunOptions, Settings, TransferMode,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn engine(root: &Path, backend: Backend) -> Engine {
    let mut settings = Settings::default();
    settings.storage.backend = backend;
    settings.retry.base_delay_ms = 1;
    Engine::open(settings, root).await.unwrap()
}

fn write_file(path: PathBuf, bytes: &[u8]) -> PathBuf {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, bytes).unwrap();
    path
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn concurrent_identical_items_keep_a_single_canonical() {
    for backend in [Backend::Sqlite, Backend::Json] {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), backend).await;

        let source = Arc::new(InMemorySource::new());
        for id in 1..=6 {
            source
                .insert("chat", id, &format!("copy{id}.jpg"), b"one and the same picture")
                .await;
        }

        let summary = engine
            .run_collection(source.clone(), "chat", RunOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 1, "{backend:?}");
        assert_eq!(summary.duplicate, 5, "{backend:?}");
        assert_eq!(summary.failed, 0);

        let store = engine.store();
        assert_eq!(store.list_hash_entries().await.unwrap().len(), 1);

        let cid = summary.collection_id;
        let canonical: Vec<_> = store
            .list_items(cid)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.status == Some(ItemStatus::Downloaded))
            .collect();
        assert_eq!(canonical.len(), 1);
        let canonical = canonical[0].item_ref();

        let links = store.list_duplicates(cid).await.unwrap();
        assert_eq!(links.len(), 5);
        assert!(links.iter().all(|l| l.canonical == canonical));
        assert_eq!(files_in(&engine.collection_dir("chat")).len(), 1);
    }
}

#[tokio::test]
async fn racing_registrations_across_collections_link_once() {
    let temp = TempDir::new().unwrap();
    let engine = engine(temp.path(), Backend::Sqlite).await;
    let a = engine.store().ensure_collection("a").await.unwrap();
    let b = engine.store().ensure_collection("b").await.unwrap();

    let pa = write_file(engine.collection_dir("a").join("1_x.jpg"), &[9u8; 4096]);
    let pb = write_file(engine.collection_dir("b").join("2_x.jpg"), &[9u8; 4096]);
    let fp = sample_fingerprint(&pa, engine.settings().dedup.sample_bytes).unwrap();

    let (ra, rb) = tokio::join!(
        engine.register_download(a.id, 1, &pa, 4096, &fp, None),
        engine.register_download(b.id, 2, &pb, 4096, &fp, None),
    );
    let outcomes = [ra.unwrap(), rb.unwrap()];
    let stored = outcomes
        .iter()
        .filter(|o| **o == DownloadOutcome::Stored)
        .count();
    assert_eq!(stored, 1);

    let store = engine.store();
    assert_eq!(store.list_hash_entries().await.unwrap().len(), 1);
    let links = store.list_duplicates(a.id).await.unwrap().len()
        + store.list_duplicates(b.id).await.unwrap().len();
    assert_eq!(links, 1);
    assert_eq!(pa.exists() as u8 + pb.exists() as u8, 1);

    let found = engine.find_duplicate(b.id, 4096, &fp).await.unwrap();
    assert!(found.is_some());
    assert_eq!(engine.find_duplicate(b.id, 4096, "nope").await.unwrap(), None);
}

#[tokio::test]
async fn a_promoted_canonical_drops_its_old_link() {
    for backend in [Backend::Sqlite, Backend::Json] {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), backend).await;
        let source = Arc::new(InMemorySource::new());
        source.insert("chat", 1, "a.jpg", b"same bytes").await;
        source.insert("chat", 2, "b.jpg", b"same bytes").await;

        let first = engine
            .run_collection(source.clone(), "chat", RunOptions::default())
            .await
            .unwrap();
        let cid = first.collection_id;
        let store = engine.store();
        let links = store.list_duplicates(cid).await.unwrap();
        assert_eq!(links.len(), 1, "{backend:?}");
        let dup = links[0].source_id;
        let kept = links[0].canonical.source_id;

        let kept_path = store.get_item(cid, kept).await.unwrap().unwrap().local_path.unwrap();
        std::fs::remove_file(kept_path).unwrap();

        let only = |id| RunOptions {
            ids: Some(vec![id]),
            ..RunOptions::default()
        };
        let promoted = engine
            .run_collection(source.clone(), "chat", only(dup))
            .await
            .unwrap();
        assert_eq!(promoted.downloaded, 1, "{backend:?}");
        assert_eq!(store.is_duplicate(cid, dup).await.unwrap(), None);
        let status = store.get_status(cid, dup).await.unwrap().unwrap();
        assert_eq!(status.status, ItemStatus::Downloaded);

        let relinked = engine
            .run_collection(source.clone(), "chat", only(kept))
            .await
            .unwrap();
        assert_eq!(relinked.duplicate, 1, "{backend:?}");

        let links = store.list_duplicates(cid).await.unwrap();
        assert_eq!(links.len(), 1, "{backend:?}");
        assert_eq!(links[0].source_id, kept);
        assert_eq!(links[0].canonical.source_id, dup);
    }
}

#[tokio::test]
async fn second_run_skips_intact_items_and_resume_refetches_damaged_ones() {
    let temp = TempDir::new().unwrap();
    let engine = engine(temp.path(), Backend::Sqlite).await;
    let source = Arc::new(InMemorySource::new());
    source.insert("chat", 1, "a.jpg", b"alpha").await;
    source.insert("chat", 2, "b.jpg", b"bravo!").await;
    source.insert("chat", 3, "c.jpg", b"charlie").await;

    let first = engine
        .run_collection(source.clone(), "chat", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.downloaded, 3);
    assert_eq!(first.bytes_downloaded, 5 + 6 + 7);
    assert_eq!(source.fetch_count(), 3);

    let c = engine.store().get_collection(first.collection_id).await.unwrap().unwrap();
    assert!(c.completed);
    assert_eq!(c.last_source_cursor, Some(3));
    assert_eq!(
        files_in(&engine.collection_dir("chat")),
        vec!["1_a.jpg", "2_b.jpg", "3_c.jpg"]
    );

    let second = engine
        .run_collection(source.clone(), "chat", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(second.skipped, 3);
    assert_eq!(second.downloaded, 0);
    assert_eq!(source.fetch_count(), 3);

    let item = engine.store().get_item(first.collection_id, 2).await.unwrap().unwrap();
    std::fs::remove_file(item.local_path.unwrap()).unwrap();

    let report = engine.validate_resume(first.collection_id).await.unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.invalid, 1);
    let status = engine.store().get_status(first.collection_id, 2).await.unwrap().unwrap();
    assert_eq!(status.status, ItemStatus::Failed);
    assert_eq!(status.reason.as_deref(), Some("resume validation failed"));

    let third = engine
        .run_collection(source.clone(), "chat", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(third.downloaded, 1);
    assert_eq!(third.skipped, 2);
    assert_eq!(source.fetch_count(), 4);
}

#[tokio::test]
async fn failures_are_retried_then_recorded() {
    let temp = TempDir::new().unwrap();
    let engine = engine(temp.path(), Backend::Json).await;
    let source = Arc::new(InMemorySource::new());
    source.insert("chat", 1, "a.jpg", b"alpha").await;
    source.insert("chat", 2, "b.jpg", b"bravo").await;
    source.insert("chat", 3, "c.jpg", b"charlie").await;
    source.fail_next("chat", 1, &[Fault::Transient, Fault::ZeroBytes]).await;
    source.fail_next("chat", 2, &[Fault::Permanent]).await;
    source
        .fail_next("chat", 3, &[Fault::ZeroBytes, Fault::ZeroBytes, Fault::ZeroBytes])
        .await;

    let summary = engine
        .run_collection(source.clone(), "chat", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(source.fetch_count(), 3 + 1 + 3);

    let cid = summary.collection_id;
    let permanent = engine.store().get_status(cid, 2).await.unwrap().unwrap();
    assert_eq!(permanent.status, ItemStatus::Failed);
    assert!(permanent.reason.unwrap().contains("expired"));

    let corrupt = engine.store().get_item(cid, 3).await.unwrap().unwrap();
    assert_eq!(corrupt.location, StorageLocation::Missing);
    assert_eq!(files_in(&engine.collection_dir("chat")), vec!["1_a.jpg"]);

    let retried = engine
        .run_collection(source.clone(), "chat", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(retried.downloaded, 2);
    assert_eq!(retried.skipped, 1);
}

#[tokio::test]
async fn explicit_ids_report_missing_and_cancelled_runs_stay_incomplete() {
    let temp = TempDir::new().unwrap();
    let engine = engine(temp.path(), Backend::Sqlite).await;
    let source = Arc::new(InMemorySource::new());
    source.insert("chat", 1, "a.jpg", b"alpha").await;

    let summary = engine
        .run_collection(
            source.clone(),
            "chat",
            RunOptions {
                ids: Some(vec![1, 99]),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.missing, 1);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let other: Arc<dyn SourceProvider> = source.clone();
    let err = engine
        .run_collection(
            other,
            "other",
            RunOptions {
                cancel: Some(cancel),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    let other = engine.store().ensure_collection("other").await.unwrap();
    assert!(!other.completed);
}

#[tokio::test]
async fn transfer_then_reconcile_sees_both_sides() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("backup");
    let engine = engine(&root, Backend::Sqlite).await;
    let mirror = LocalDirMirror::new(temp.path().join("remote"));

    let source = Arc::new(InMemorySource::new());
    source.insert("chat", 1, "a.jpg", b"alpha").await;
    source.insert("chat", 2, "b.jpg", b"bravo").await;
    let summary = engine
        .run_collection(source, "chat", RunOptions::default())
        .await
        .unwrap();
    let cid = summary.collection_id;

    let copied = engine
        .transfer_to_mirror("chat", &mirror, "backup", TransferMode::Copy)
        .await
        .unwrap();
    assert_eq!(copied.transferred, 2);
    let again = engine
        .transfer_to_mirror("chat", &mirror, "backup", TransferMode::Copy)
        .await
        .unwrap();
    assert_eq!(again.transferred, 0);
    assert_eq!(again.already_remote, 2);

    let listing = engine.remote_listing(&mirror, "backup", "chat").await.unwrap();
    assert_eq!(listing.len(), 2);
    let report = engine.reconcile("chat", Some(listing.as_slice())).await.unwrap();
    assert_eq!(report.both, 2);
    assert_eq!(report.mismatched, 0);

    let item = engine.store().get_item(cid, 1).await.unwrap().unwrap();
    assert_eq!(item.location, StorageLocation::Both);
    assert_eq!(item.remote_ref.as_deref(), Some("1_a.jpg"));
    assert!(mirror.root().join("backup/chat/1_a.jpg").is_file());
}

#[tokio::test]
async fn a_failed_state_write_aborts_the_run() {
    let temp = TempDir::new().unwrap();
    let engine = engine(temp.path(), Backend::Json).await;
    engine.store().ensure_collection("chat").await.unwrap();

    let doc = collection_doc_path(&engine.settings().state_dir(engine.root()), &name_hash("chat"));
    std::fs::remove_file(&doc).unwrap();
    write_file(doc.join("occupied"), b"x");

    let source = Arc::new(InMemorySource::new());
    source.insert("chat", 1, "a.jpg", b"alpha").await;
    let err = engine
        .run_collection(source, "chat", RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StateWrite { .. }), "{err:?}");
    assert!(err.is_fatal());
}
