use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use super::ItemStore;
use crate::model::{CollectionId, CollectionUpdate, DuplicateLink, ItemAttrs, ItemRef, StatusRecord};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub collections: u64,
    pub items: u64,
    pub statuses: u64,
    pub duplicates_inserted: u64,
    pub hash_entries_inserted: u64,
}

/// Copies every collection, item, status, duplicate link and hash entry from `from` into `to`.
///
/// Collections are matched by display name, so ids may differ between backends and are
/// translated. Item touch times and status/link timestamps are kept. Running it again
/// against the same pair changes nothing.
pub async fn migrate_store(from: &dyn ItemStore, to: &dyn ItemStore) -> Result<MigrationReport> {
    info!(
        event = "migrate.start",
        from = from.backend(),
        to = to.backend(),
        "migrate.start"
    );
    let mut report = MigrationReport::default();

    let collections = from.list_collections().await?;
    let mut ids: HashMap<CollectionId, CollectionId> = HashMap::new();
    for c in &collections {
        let dst = to.ensure_collection(&c.name).await?;
        ids.insert(c.id, dst.id);
        report.collections += 1;
    }
    let translate = |id: CollectionId| -> Result<CollectionId> {
        ids.get(&id)
            .copied()
            .ok_or_else(|| Error::integrity(format!("reference to unknown collection {id}")))
    };

    for c in &collections {
        let dst_id = translate(c.id)?;

        for item in from.list_items(c.id).await? {
            let attrs = ItemAttrs {
                touched_at: Some(item.touched_at.clone()),
                ..item.attrs()
            };
            to.upsert_item(dst_id, item.source_id, attrs).await?;
            report.items += 1;
        }

        for st in from.list_statuses(c.id).await? {
            let record = StatusRecord {
                collection_id: dst_id,
                ..st
            };
            to.import_status(&record).await?;
            report.statuses += 1;
        }

        for link in from.list_duplicates(c.id).await? {
            let translated = DuplicateLink {
                collection_id: dst_id,
                canonical: ItemRef::new(
                    translate(link.canonical.collection_id)?,
                    link.canonical.source_id,
                ),
                ..link
            };
            if to.import_duplicate(&translated).await? {
                report.duplicates_inserted += 1;
            }
        }

        to.update_collection(
            dst_id,
            CollectionUpdate {
                completed: Some(c.completed),
                last_source_cursor: c.last_source_cursor,
            },
        )
        .await?;
        debug!(
            event = "migrate.collection.done",
            name = %c.name,
            from_id = c.id,
            to_id = dst_id,
            "migrate.collection.done"
        );
    }

    for mut entry in from.list_hash_entries().await? {
        if let Some(item) = entry.first_item {
            entry.first_item = Some(ItemRef::new(
                translate(item.collection_id)?,
                item.source_id,
            ));
        }
        if to.register_hash(&entry).await? {
            report.hash_entries_inserted += 1;
        }
    }

    info!(
        event = "migrate.finish",
        collections = report.collections,
        items = report.items,
        statuses = report.statuses,
        duplicates_inserted = report.duplicates_inserted,
        hash_entries_inserted = report.hash_entries_inserted,
        "migrate.finish"
    );
    Ok(report)
}
