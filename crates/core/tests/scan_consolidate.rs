use std::path::{Path, PathBuf};
use std::sync::Mutex;

use mediakeep_core::model::{HashKey, ItemAttrs, ItemRef, StorageLocation};
use mediakeep_core::progress::{ProgressSink, TaskProgress};
use mediakeep_core::{Backend, Engine, Error, Settings, write_groups_json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

async fn engine(root: &Path) -> Engine {
    let mut settings = Settings::default();
    settings.storage.backend = Backend::Sqlite;
    settings.progress.min_interval_ms = 0;
    Engine::open(settings, root).await.unwrap()
}

fn seed(root: &Path) {
    let same = vec![7u8; 1000];
    write_file(root.join("a/x.bin"), &same);
    write_file(root.join("b/x.bin"), &same);
    write_file(root.join("c/y.bin"), &same);
    write_file(root.join("a/unique.bin"), &[1u8; 1000]);
    write_file(root.join(".hidden/x.bin"), &same);
    write_file(root.join("a/empty1"), b"");
    write_file(root.join("b/empty2"), b"");
}

fn referenced(path: &str) -> ItemAttrs {
    ItemAttrs {
        local_path: Some(path.to_string()),
        size: 1000,
        location: StorageLocation::Local,
        ..ItemAttrs::default()
    }
}

#[derive(Default)]
struct Phases(Mutex<Vec<String>>);

impl ProgressSink for Phases {
    fn on_progress(&self, progress: TaskProgress) {
        self.0.lock().unwrap().push(progress.phase);
    }
}

#[tokio::test]
async fn consolidation_keeps_the_referenced_copy_and_conserves_bytes() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("backup");
    seed(&root);
    let engine = engine(&root).await;

    let phases = Phases::default();
    let groups = engine.scan_for_duplicates(None, Some(&phases), None).unwrap();
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.size, 1000);
    assert_eq!(group.paths.len(), 3);
    assert!(group.full_hash.is_some());
    assert_eq!(phases.0.lock().unwrap().last().map(String::as_str), Some("done"));

    let keep = group.paths[1].clone();
    assert!(keep.ends_with("b/x.bin"));
    let c = engine.store().ensure_collection("chat").await.unwrap();
    engine.store().upsert_item(c.id, 5, referenced(&keep)).await.unwrap();

    let report = engine.consolidate(&groups).await.unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.moved, 2);
    assert_eq!(report.bytes_moved, 2000);
    assert_eq!(report.failed, 0);
    assert_eq!(report.records_updated, 0);

    let quarantine = root.join("duplicates");
    assert!(Path::new(&keep).is_file());
    assert!(!root.join("a/x.bin").exists());
    assert!(!root.join("c/y.bin").exists());
    let kept_bytes: u64 = [
        PathBuf::from(&keep),
        quarantine.join("a/x.bin"),
        quarantine.join("c/y.bin"),
    ]
    .iter()
    .map(|p| std::fs::metadata(p).unwrap().len())
    .sum();
    assert_eq!(kept_bytes, 3000);

    let entry = engine
        .store()
        .get_hash(&HashKey::new(1000, &group.fingerprint))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.first_path, keep);
    assert_eq!(entry.first_item, Some(ItemRef::new(c.id, 5)));

    let rescan = engine.scan_for_duplicates(None, None, None).unwrap();
    assert!(rescan.is_empty());
    let noop = engine.consolidate(&rescan).await.unwrap();
    assert_eq!(noop.moved, 0);
}

#[tokio::test]
async fn moved_copies_carry_their_records_along() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("backup");
    seed(&root);
    let engine = engine(&root).await;

    let groups = engine.scan_for_duplicates(None, None, None).unwrap();
    let paths = groups[0].paths.clone();
    let c = engine.store().ensure_collection("chat").await.unwrap();
    engine.store().upsert_item(c.id, 1, referenced(&paths[0])).await.unwrap();
    engine.store().upsert_item(c.id, 3, referenced(&paths[2])).await.unwrap();

    let report = engine.consolidate(&groups).await.unwrap();
    assert_eq!(report.moved, 2);
    assert_eq!(report.records_updated, 1);

    let first = engine.store().get_item(c.id, 1).await.unwrap().unwrap();
    assert_eq!(first.local_path.as_deref(), Some(paths[0].as_str()));
    let moved = engine.store().get_item(c.id, 3).await.unwrap().unwrap();
    let moved_path = moved.local_path.unwrap();
    assert!(moved_path.contains("duplicates"));
    assert!(Path::new(&moved_path).is_file());
    assert_eq!(moved.filename.as_deref(), Some("y.bin"));
}

#[tokio::test]
async fn scan_rejects_missing_roots_and_honours_cancellation() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("backup");
    seed(&root);
    let engine = engine(&root).await;

    let err = engine
        .scan_for_duplicates(Some(&temp.path().join("absent")), None, None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput { .. }));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine
        .scan_for_duplicates(None, None, Some(&cancel))
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn dotted_roots_resolve_to_the_recorded_paths() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("backup");
    write_file(root.join("chat/1_a.jpg"), &[3u8; 1000]);
    write_file(root.join("aaa/copy.jpg"), &[3u8; 1000]);

    let dotted = temp.path().join(".").join("backup");
    let engine = engine(&dotted).await;
    assert_eq!(engine.root(), root.as_path());

    let recorded = root.join("chat/1_a.jpg").to_str().unwrap().to_string();
    let c = engine.store().ensure_collection("chat").await.unwrap();
    engine.store().upsert_item(c.id, 1, referenced(&recorded)).await.unwrap();

    let groups = engine.scan_for_duplicates(Some(&dotted), None, None).unwrap();
    assert_eq!(groups.len(), 1);
    assert!(groups[0].paths.iter().all(|p| !p.contains("/./")));
    assert!(groups[0].paths.contains(&recorded));

    let report = engine.consolidate(&groups).await.unwrap();
    assert_eq!(report.moved, 1);
    assert!(Path::new(&recorded).is_file());
    assert!(!root.join("aaa/copy.jpg").exists());
    assert!(root.join("duplicates/aaa/copy.jpg").is_file());
    let item = engine.store().get_item(c.id, 1).await.unwrap().unwrap();
    assert_eq!(item.local_path.as_deref(), Some(recorded.as_str()));
}

#[tokio::test]
async fn repeated_scans_of_an_unchanged_tree_are_identical() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("backup");
    seed(&root);
    write_file(root.join("z/late.bin"), &[5u8; 300]);
    write_file(root.join("a/early.bin"), &[5u8; 300]);
    let engine = engine(&root).await;

    let first = engine.scan_for_duplicates(None, None, None).unwrap();
    let second = engine.scan_for_duplicates(None, None, None).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    for group in &first {
        let mut sorted = group.paths.clone();
        sorted.sort();
        assert_eq!(group.paths, sorted);
    }
    assert!(first[0].paths < first[1].paths);

    let out = temp.path().join("out");
    write_groups_json(&first, &out.join("first.json")).unwrap();
    write_groups_json(&second, &out.join("second.json")).unwrap();
    let a = std::fs::read(out.join("first.json")).unwrap();
    let b = std::fs::read(out.join("second.json")).unwrap();
    assert_eq!(a, b);

    let parsed: Vec<Vec<String>> = serde_json::from_slice(&a).unwrap();
    assert_eq!(parsed, first.iter().map(|g| g.paths.clone()).collect::<Vec<_>>());
}
