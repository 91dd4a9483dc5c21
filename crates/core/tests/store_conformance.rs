use std::sync::Arc;

use mediakeep_core::model::{
    CollectionUpdate, HashIndexEntry, HashKey, ItemAttrs, ItemRef, ItemStatus, StorageLocation,
};
use mediakeep_core::{Error, ItemStore, JsonItemStore, SqliteItemStore, migrate_store};
use tempfile::TempDir;

async fn backends(temp: &TempDir) -> Vec<Arc<dyn ItemStore>> {
    vec![
        Arc::new(
            SqliteItemStore::open(&temp.path().join("db").join("mediakeep.sqlite"))
                .await
                .unwrap(),
        ),
        Arc::new(JsonItemStore::open(&temp.path().join("state")).unwrap()),
    ]
}

fn local(path: &str, size: u64) -> ItemAttrs {
    ItemAttrs {
        filename: path.rsplit('/').next().map(str::to_string),
        local_path: Some(path.to_string()),
        size,
        sample_fingerprint: Some(format!("fp-{size}")),
        location: StorageLocation::Local,
        ..ItemAttrs::default()
    }
}

#[tokio::test]
async fn counters_move_only_when_an_item_is_first_inserted() {
    let temp = TempDir::new().unwrap();
    for store in backends(&temp).await {
        let c = store.ensure_collection("Family Chat").await.unwrap();
        let again = store.ensure_collection("Family Chat").await.unwrap();
        assert_eq!(c.id, again.id, "{}", store.backend());

        store.upsert_item(c.id, 1, local("/b/1_a.jpg", 10)).await.unwrap();
        store.upsert_item(c.id, 1, local("/b/1_a.jpg", 10)).await.unwrap();
        store.upsert_item(c.id, 2, local("/b/2_b.jpg", 5)).await.unwrap();

        let c = store.get_collection(c.id).await.unwrap().unwrap();
        assert_eq!(c.total_files, 2, "{}", store.backend());
        assert_eq!(c.total_bytes, 15, "{}", store.backend());

        let items = store.list_items(c.id).await.unwrap();
        let ids: Vec<i64> = items.iter().map(|i| i.source_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}

#[tokio::test]
async fn statuses_are_upserts_and_counted() {
    let temp = TempDir::new().unwrap();
    for store in backends(&temp).await {
        let c = store.ensure_collection("chat").await.unwrap();
        for sid in 1..=3 {
            store.upsert_item(c.id, sid, local(&format!("/b/{sid}.jpg"), 1)).await.unwrap();
        }
        store.set_status(c.id, 1, ItemStatus::Failed, Some("timeout")).await.unwrap();
        store.set_status(c.id, 1, ItemStatus::Downloaded, None).await.unwrap();
        store.set_status(c.id, 2, ItemStatus::Downloaded, None).await.unwrap();
        store.set_status(c.id, 3, ItemStatus::Missing, Some("gone")).await.unwrap();

        let rec = store.get_status(c.id, 1).await.unwrap().unwrap();
        assert_eq!(rec.status, ItemStatus::Downloaded);
        assert_eq!(rec.reason, None);

        let counts = store.status_counts(c.id).await.unwrap();
        assert_eq!(counts.get(&ItemStatus::Downloaded), Some(&2), "{}", store.backend());
        assert_eq!(counts.get(&ItemStatus::Missing), Some(&1));
        assert_eq!(counts.get(&ItemStatus::Failed), None);
        assert_eq!(store.list_statuses(c.id).await.unwrap().len(), 3);
    }
}

#[tokio::test]
async fn duplicate_links_reject_self_and_keep_the_first_link() {
    let temp = TempDir::new().unwrap();
    for store in backends(&temp).await {
        let a = store.ensure_collection("a").await.unwrap();
        let b = store.ensure_collection("b").await.unwrap();
        let canonical = ItemRef::new(a.id, 1);

        let err = store.mark_duplicate(a.id, 1, canonical).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }), "{}", store.backend());

        assert!(store.mark_duplicate(b.id, 7, canonical).await.unwrap());
        assert!(!store.mark_duplicate(b.id, 7, canonical).await.unwrap());
        assert!(!store.mark_duplicate(b.id, 7, ItemRef::new(a.id, 2)).await.unwrap());

        assert_eq!(store.is_duplicate(b.id, 7).await.unwrap(), Some(canonical));
        assert_eq!(store.is_duplicate(b.id, 8).await.unwrap(), None);
        assert_eq!(store.list_duplicates(b.id).await.unwrap().len(), 1);

        assert!(store.mark_duplicate(9_999, 1, canonical).await.is_err());

        assert!(store.unlink_duplicate(b.id, 7).await.unwrap());
        assert!(!store.unlink_duplicate(b.id, 7).await.unwrap());
        assert!(!store.unlink_duplicate(9_999, 7).await.unwrap());
        assert_eq!(store.is_duplicate(b.id, 7).await.unwrap(), None);
        assert!(store.mark_duplicate(b.id, 7, ItemRef::new(a.id, 2)).await.unwrap());
        assert_eq!(
            store.is_duplicate(b.id, 7).await.unwrap(),
            Some(ItemRef::new(a.id, 2))
        );
    }
}

#[tokio::test]
async fn update_path_rewrites_every_matching_record() {
    let temp = TempDir::new().unwrap();
    for store in backends(&temp).await {
        let a = store.ensure_collection("a").await.unwrap();
        let b = store.ensure_collection("b").await.unwrap();
        store.upsert_item(a.id, 1, local("/b/x.jpg", 3)).await.unwrap();
        store.upsert_item(b.id, 4, local("/b/x.jpg", 3)).await.unwrap();
        store.upsert_item(b.id, 5, local("/b/y.jpg", 3)).await.unwrap();

        let n = store.update_path("/b/x.jpg", "/b/dupes/x (1).jpg").await.unwrap();
        assert_eq!(n, 2, "{}", store.backend());

        let moved = store.find_items_by_path("/b/dupes/x (1).jpg").await.unwrap();
        assert_eq!(moved.len(), 2);
        assert!(moved.iter().all(|i| i.filename.as_deref() == Some("x (1).jpg")));
        assert!(store.find_items_by_path("/b/x.jpg").await.unwrap().is_empty());
        assert_eq!(store.update_path("/nowhere", "/else").await.unwrap(), 0);
    }
}

#[tokio::test]
async fn hash_entries_are_first_write_wins() {
    let temp = TempDir::new().unwrap();
    for store in backends(&temp).await {
        let c = store.ensure_collection("chat").await.unwrap();
        let first = HashIndexEntry::new(10, "abc", "/b/1.jpg", Some(ItemRef::new(c.id, 1)));
        let second = HashIndexEntry::new(10, "abc", "/b/2.jpg", Some(ItemRef::new(c.id, 2)));

        assert!(store.register_hash(&first).await.unwrap());
        assert!(!store.register_hash(&second).await.unwrap());

        let key = HashKey::new(10, "abc");
        let got = store.get_hash(&key).await.unwrap().unwrap();
        assert_eq!(got.first_path, "/b/1.jpg", "{}", store.backend());
        assert_eq!(store.list_hash_entries().await.unwrap().len(), 1);

        assert!(store.remove_hash(&key).await.unwrap());
        assert!(!store.remove_hash(&key).await.unwrap());
        assert!(store.register_hash(&second).await.unwrap());
    }
}

#[tokio::test]
async fn collection_progress_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("mediakeep.sqlite");
    let json_dir = temp.path().join("state");

    for reopen_json in [false, true] {
        let id = {
            let store: Arc<dyn ItemStore> = if reopen_json {
                Arc::new(JsonItemStore::open(&json_dir).unwrap())
            } else {
                Arc::new(SqliteItemStore::open(&db).await.unwrap())
            };
            let c = store.ensure_collection("chat").await.unwrap();
            store.upsert_item(c.id, 42, local("/b/42.jpg", 9)).await.unwrap();
            store
                .update_collection(
                    c.id,
                    CollectionUpdate {
                        completed: Some(true),
                        last_source_cursor: Some(42),
                    },
                )
                .await
                .unwrap();
            c.id
        };

        let store: Arc<dyn ItemStore> = if reopen_json {
            Arc::new(JsonItemStore::open(&json_dir).unwrap())
        } else {
            Arc::new(SqliteItemStore::open(&db).await.unwrap())
        };
        let c = store.get_collection(id).await.unwrap().unwrap();
        assert!(c.completed);
        assert!(c.completed_at.is_some());
        assert_eq!(c.last_source_cursor, Some(42));
        assert!(store.get_item(id, 42).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn migration_copies_everything_and_is_repeatable() {
    let temp = TempDir::new().unwrap();
    let from: Arc<dyn ItemStore> = Arc::new(JsonItemStore::open(&temp.path().join("state")).unwrap());
    let to: Arc<dyn ItemStore> = Arc::new(
        SqliteItemStore::open(&temp.path().join("mediakeep.sqlite"))
            .await
            .unwrap(),
    );

    let a = from.ensure_collection("a").await.unwrap();
    let b = from.ensure_collection("b").await.unwrap();
    from.upsert_item(a.id, 1, local("/b/a/1.jpg", 4)).await.unwrap();
    from.upsert_item(b.id, 2, local("/b/b/2.jpg", 4)).await.unwrap();
    from.set_status(a.id, 1, ItemStatus::Downloaded, None).await.unwrap();
    from.set_status(b.id, 2, ItemStatus::Duplicate, Some("duplicate of /b/a/1.jpg")).await.unwrap();
    from.mark_duplicate(b.id, 2, ItemRef::new(a.id, 1)).await.unwrap();
    from.register_hash(&HashIndexEntry::new(4, "fp-4", "/b/a/1.jpg", Some(ItemRef::new(a.id, 1))))
        .await
        .unwrap();

    let report = migrate_store(&*from, &*to).await.unwrap();
    assert_eq!(report.collections, 2);
    assert_eq!(report.items, 2);
    assert_eq!(report.statuses, 2);
    assert_eq!(report.duplicates_inserted, 1);
    assert_eq!(report.hash_entries_inserted, 1);

    let again = migrate_store(&*from, &*to).await.unwrap();
    assert_eq!(again.duplicates_inserted, 0);
    assert_eq!(again.hash_entries_inserted, 0);

    let migrated_a = to.ensure_collection("a").await.unwrap();
    let migrated_b = to.ensure_collection("b").await.unwrap();
    assert_eq!(migrated_a.total_files, 1);
    assert_eq!(
        to.is_duplicate(migrated_b.id, 2).await.unwrap(),
        Some(ItemRef::new(migrated_a.id, 1))
    );
    let entry = to.get_hash(&HashKey::new(4, "fp-4")).await.unwrap().unwrap();
    assert_eq!(entry.first_item, Some(ItemRef::new(migrated_a.id, 1)));
}
