use std::collections::BTreeMap;
use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use super::{BoxFuture, ItemStore, basename};
use crate::model::{
    Collection, CollectionId, CollectionUpdate, DuplicateLink, HashIndexEntry, HashKey, Item,
    ItemAttrs, ItemRef, ItemStatus, SourceId, StatusRecord, StorageLocation, now_rfc3339,
};
use crate::paths::name_hash;
use crate::{Error, Result};

const ITEM_COLUMNS: &str = r#"
    i.collection_id, i.source_id, i.filename, i.path, i.remote_ref, i.size,
    i.sample_fingerprint, i.full_fingerprint, i.storage_location, i.downloaded_at,
    s.status
"#;

const ITEM_FROM: &str = r#"
    FROM items i
    LEFT JOIN item_status s
      ON s.collection_id = i.collection_id AND s.source_id = i.source_id
"#;

const COLLECTION_COLUMNS: &str = r#"
    collection_id, name, name_hash, started_at, last_updated, completed, completed_at,
    total_files, total_bytes, last_source_cursor
"#;

/// Embedded relational backend; one pooled connection, writes in transactions.
pub struct SqliteItemStore {
    pool: SqlitePool,
}

impl SqliteItemStore {
    pub async fn open(path: &Path) -> Result<Self> {
        debug!(
            event = "sqlite.open",
            db_path = %path.display(),
            create_if_missing = true,
            "sqlite.open"
        );
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!(
                    event = "io.sqlite.connect_failed",
                    db_path = %path.display(),
                    error = %e,
                    "io.sqlite.connect_failed"
                );
                e
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .map_err(|e| {
                error!(
                    event = "io.sqlite.pragma_failed",
                    db_path = %path.display(),
                    error = %e,
                    "io.sqlite.pragma_failed"
                );
                e
            })?;

        sqlx::migrate!().run(&pool).await.map_err(|e| {
            error!(
                event = "io.sqlite.migrate_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.migrate_failed"
            );
            e
        })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn require_collection(&self, id: CollectionId) -> Result<()> {
        let row = sqlx::query("SELECT 1 AS present FROM collections WHERE collection_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if row.is_none() {
            return Err(Error::InvalidInput {
                message: format!("unknown collection: {id}"),
            });
        }
        Ok(())
    }

    async fn fetch_collection(&self, id: CollectionId) -> Result<Option<Collection>> {
        let sql = format!("SELECT {COLLECTION_COLUMNS} FROM collections WHERE collection_id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(collection_from_row).transpose()
    }

    async fn insert_duplicate(&self, link: &DuplicateLink) -> Result<bool> {
        if link.canonical == ItemRef::new(link.collection_id, link.source_id) {
            return Err(Error::InvalidInput {
                message: format!("item {} cannot be its own canonical", link.canonical),
            });
        }
        self.require_collection(link.collection_id).await?;
        self.require_collection(link.canonical.collection_id)
            .await?;

        let res = sqlx::query(
            r#"
            INSERT INTO duplicates
              (collection_id, duplicate_source_id, canonical_collection_id, canonical_source_id, detected_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(collection_id, duplicate_source_id) DO NOTHING
            "#,
        )
        .bind(link.collection_id)
        .bind(link.source_id)
        .bind(link.canonical.collection_id)
        .bind(link.canonical.source_id)
        .bind(&link.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn write_status(&self, record: &StatusRecord) -> Result<()> {
        self.require_collection(record.collection_id).await?;
        sqlx::query(
            r#"
            INSERT INTO item_status (collection_id, source_id, status, reason, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(collection_id, source_id) DO UPDATE SET
              status = excluded.status,
              reason = excluded.reason,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(record.collection_id)
        .bind(record.source_id)
        .bind(record.status.as_str())
        .bind(record.reason.as_deref())
        .bind(&record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl ItemStore for SqliteItemStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn ensure_collection<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Collection> {
        Box::pin(async move {
            let key = name_hash(name);
            let now = now_rfc3339();
            let res = sqlx::query(
                r#"
                INSERT INTO collections (name, name_hash, started_at, last_updated)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(name_hash) DO NOTHING
                "#,
            )
            .bind(name)
            .bind(&key)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 1 {
                debug!(event = "store.collection.created", name, name_hash = %key, "store.collection.created");
            }

            let sql = format!("SELECT {COLLECTION_COLUMNS} FROM collections WHERE name_hash = ?");
            let row = sqlx::query(&sql)
                .bind(&key)
                .fetch_one(&self.pool)
                .await?;
            collection_from_row(&row)
        })
    }

    fn get_collection<'a>(&'a self, id: CollectionId) -> BoxFuture<'a, Option<Collection>> {
        Box::pin(self.fetch_collection(id))
    }

    fn list_collections<'a>(&'a self) -> BoxFuture<'a, Vec<Collection>> {
        Box::pin(async move {
            let sql = format!("SELECT {COLLECTION_COLUMNS} FROM collections ORDER BY collection_id");
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            rows.iter().map(collection_from_row).collect()
        })
    }

    fn update_collection<'a>(
        &'a self,
        id: CollectionId,
        update: CollectionUpdate,
    ) -> BoxFuture<'a, Collection> {
        Box::pin(async move {
            self.require_collection(id).await?;
            let now = now_rfc3339();
            let mut tx = self.pool.begin().await?;

            sqlx::query("UPDATE collections SET last_updated = ? WHERE collection_id = ?")
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;

            if let Some(completed) = update.completed {
                let completed_at = completed.then(|| now.clone());
                sqlx::query(
                    "UPDATE collections SET completed = ?, completed_at = ? WHERE collection_id = ?",
                )
                .bind(i64::from(completed))
                .bind(completed_at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }

            if let Some(cursor) = update.last_source_cursor {
                sqlx::query("UPDATE collections SET last_source_cursor = ? WHERE collection_id = ?")
                    .bind(cursor)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;

            self.fetch_collection(id)
                .await?
                .ok_or_else(|| Error::integrity(format!("collection {id} vanished during update")))
        })
    }

    fn upsert_item<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        attrs: ItemAttrs,
    ) -> BoxFuture<'a, ItemRef> {
        Box::pin(async move {
            self.require_collection(collection_id).await?;
            let size = to_i64(attrs.size)?;
            let touched_at = attrs.touched_at.clone().unwrap_or_else(now_rfc3339);
            let now = now_rfc3339();

            let mut tx = self.pool.begin().await?;
            let existing = sqlx::query(
                "SELECT 1 AS present FROM items WHERE collection_id = ? AND source_id = ?",
            )
            .bind(collection_id)
            .bind(source_id)
            .fetch_optional(&mut *tx)
            .await?;

            if existing.is_some() {
                sqlx::query(
                    r#"
                    UPDATE items SET
                      filename = ?, path = ?, remote_ref = ?, size = ?,
                      sample_fingerprint = ?, full_fingerprint = ?,
                      storage_location = ?, downloaded_at = ?
                    WHERE collection_id = ? AND source_id = ?
                    "#,
                )
                .bind(attrs.filename.as_deref())
                .bind(attrs.local_path.as_deref())
                .bind(attrs.remote_ref.as_deref())
                .bind(size)
                .bind(attrs.sample_fingerprint.as_deref())
                .bind(attrs.full_fingerprint.as_deref())
                .bind(attrs.location.as_str())
                .bind(&touched_at)
                .bind(collection_id)
                .bind(source_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query("UPDATE collections SET last_updated = ? WHERE collection_id = ?")
                    .bind(&now)
                    .bind(collection_id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO items
                      (collection_id, source_id, filename, path, remote_ref, size,
                       sample_fingerprint, full_fingerprint, storage_location, downloaded_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(collection_id)
                .bind(source_id)
                .bind(attrs.filename.as_deref())
                .bind(attrs.local_path.as_deref())
                .bind(attrs.remote_ref.as_deref())
                .bind(size)
                .bind(attrs.sample_fingerprint.as_deref())
                .bind(attrs.full_fingerprint.as_deref())
                .bind(attrs.location.as_str())
                .bind(&touched_at)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE collections SET
                      total_files = total_files + 1,
                      total_bytes = total_bytes + ?,
                      last_updated = ?
                    WHERE collection_id = ?
                    "#,
                )
                .bind(size)
                .bind(&now)
                .bind(collection_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;

            Ok(ItemRef::new(collection_id, source_id))
        })
    }

    fn get_item<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<Item>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} {ITEM_FROM} WHERE i.collection_id = ? AND i.source_id = ?"
            );
            let row = sqlx::query(&sql)
                .bind(collection_id)
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(item_from_row).transpose()
        })
    }

    fn list_items<'a>(&'a self, collection_id: CollectionId) -> BoxFuture<'a, Vec<Item>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} {ITEM_FROM} WHERE i.collection_id = ? ORDER BY i.source_id"
            );
            let rows = sqlx::query(&sql)
                .bind(collection_id)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(item_from_row).collect()
        })
    }

    fn set_status<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        status: ItemStatus,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let record = StatusRecord {
                collection_id,
                source_id,
                status,
                reason: reason.map(|r| r.to_string()),
                updated_at: now_rfc3339(),
            };
            self.write_status(&record).await
        })
    }

    fn import_status<'a>(&'a self, record: &'a StatusRecord) -> BoxFuture<'a, ()> {
        Box::pin(self.write_status(record))
    }

    fn get_status<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<StatusRecord>> {
        Box::pin(async move {
            let row = sqlx::query(
                r#"
                SELECT collection_id, source_id, status, reason, updated_at
                FROM item_status
                WHERE collection_id = ? AND source_id = ?
                "#,
            )
            .bind(collection_id)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(status_from_row).transpose()
        })
    }

    fn list_statuses<'a>(
        &'a self,
        collection_id: CollectionId,
    ) -> BoxFuture<'a, Vec<StatusRecord>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT collection_id, source_id, status, reason, updated_at
                FROM item_status
                WHERE collection_id = ?
                ORDER BY source_id
                "#,
            )
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(status_from_row).collect()
        })
    }

    fn status_counts<'a>(
        &'a self,
        collection_id: CollectionId,
    ) -> BoxFuture<'a, BTreeMap<ItemStatus, u64>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT status, COUNT(*) AS n
                FROM item_status
                WHERE collection_id = ?
                GROUP BY status
                "#,
            )
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await?;

            let mut counts = BTreeMap::new();
            for row in rows {
                let status: ItemStatus = row.try_get::<String, _>("status")?.parse()?;
                counts.insert(status, from_i64(row.try_get("n")?)?);
            }
            Ok(counts)
        })
    }

    fn mark_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        canonical: ItemRef,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let link = DuplicateLink {
                collection_id,
                source_id,
                canonical,
                detected_at: now_rfc3339(),
            };
            self.insert_duplicate(&link).await
        })
    }

    fn import_duplicate<'a>(&'a self, link: &'a DuplicateLink) -> BoxFuture<'a, bool> {
        Box::pin(self.insert_duplicate(link))
    }

    fn unlink_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let res = sqlx::query(
                "DELETE FROM duplicates WHERE collection_id = ? AND duplicate_source_id = ?",
            )
            .bind(collection_id)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
            Ok(res.rows_affected() == 1)
        })
    }

    fn is_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<ItemRef>> {
        Box::pin(async move {
            let row = sqlx::query(
                r#"
                SELECT canonical_collection_id, canonical_source_id
                FROM duplicates
                WHERE collection_id = ? AND duplicate_source_id = ?
                "#,
            )
            .bind(collection_id)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(r) => Ok(Some(ItemRef::new(
                    r.try_get("canonical_collection_id")?,
                    r.try_get("canonical_source_id")?,
                ))),
                None => Ok(None),
            }
        })
    }

    fn list_duplicates<'a>(
        &'a self,
        collection_id: CollectionId,
    ) -> BoxFuture<'a, Vec<DuplicateLink>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT collection_id, duplicate_source_id, canonical_collection_id,
                       canonical_source_id, detected_at
                FROM duplicates
                WHERE collection_id = ?
                ORDER BY duplicate_source_id
                "#,
            )
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|r| {
                    Ok(DuplicateLink {
                        collection_id: r.try_get("collection_id")?,
                        source_id: r.try_get("duplicate_source_id")?,
                        canonical: ItemRef::new(
                            r.try_get("canonical_collection_id")?,
                            r.try_get("canonical_source_id")?,
                        ),
                        detected_at: r.try_get("detected_at")?,
                    })
                })
                .collect()
        })
    }

    fn update_path<'a>(&'a self, old_path: &'a str, new_path: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let now = now_rfc3339();
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                UPDATE collections SET last_updated = ?
                WHERE collection_id IN (SELECT collection_id FROM items WHERE path = ?)
                "#,
            )
            .bind(&now)
            .bind(old_path)
            .execute(&mut *tx)
            .await?;

            let res = sqlx::query(
                "UPDATE items SET path = ?, filename = ?, downloaded_at = ? WHERE path = ?",
            )
            .bind(new_path)
            .bind(basename(new_path))
            .bind(&now)
            .bind(old_path)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok(res.rows_affected())
        })
    }

    fn find_items_by_path<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Vec<Item>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} {ITEM_FROM} WHERE i.path = ? ORDER BY i.collection_id, i.source_id"
            );
            let rows = sqlx::query(&sql)
                .bind(path)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(item_from_row).collect()
        })
    }

    fn register_hash<'a>(&'a self, entry: &'a HashIndexEntry) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let res = sqlx::query(
                r#"
                INSERT INTO hash_index
                  (hash_key, size, fingerprint, first_path, first_collection_id, first_source_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(hash_key) DO NOTHING
                "#,
            )
            .bind(entry.key.as_str())
            .bind(to_i64(entry.size)?)
            .bind(&entry.fingerprint)
            .bind(&entry.first_path)
            .bind(entry.first_item.map(|r| r.collection_id))
            .bind(entry.first_item.map(|r| r.source_id))
            .bind(&entry.created_at)
            .execute(&self.pool)
            .await?;
            Ok(res.rows_affected() == 1)
        })
    }

    fn get_hash<'a>(&'a self, key: &'a HashKey) -> BoxFuture<'a, Option<HashIndexEntry>> {
        Box::pin(async move {
            let row = sqlx::query(
                r#"
                SELECT hash_key, size, fingerprint, first_path, first_collection_id,
                       first_source_id, created_at
                FROM hash_index
                WHERE hash_key = ?
                "#,
            )
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(hash_entry_from_row).transpose()
        })
    }

    fn remove_hash<'a>(&'a self, key: &'a HashKey) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let res = sqlx::query("DELETE FROM hash_index WHERE hash_key = ?")
                .bind(key.as_str())
                .execute(&self.pool)
                .await?;
            Ok(res.rows_affected() == 1)
        })
    }

    fn list_hash_entries<'a>(&'a self) -> BoxFuture<'a, Vec<HashIndexEntry>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT hash_key, size, fingerprint, first_path, first_collection_id,
                       first_source_id, created_at
                FROM hash_index
                ORDER BY hash_key
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(hash_entry_from_row).collect()
        })
    }
}

fn to_i64(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| Error::InvalidInput {
        message: format!("value out of range for storage: {v}"),
    })
}

fn from_i64(v: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| Error::integrity(format!("negative counter in store: {v}")))
}

fn collection_from_row(row: &SqliteRow) -> Result<Collection> {
    Ok(Collection {
        id: row.try_get("collection_id")?,
        name: row.try_get("name")?,
        name_hash: row.try_get("name_hash")?,
        started_at: row.try_get("started_at")?,
        last_updated: row.try_get("last_updated")?,
        completed: row.try_get::<i64, _>("completed")? != 0,
        completed_at: row.try_get("completed_at")?,
        total_files: from_i64(row.try_get("total_files")?)?,
        total_bytes: from_i64(row.try_get("total_bytes")?)?,
        last_source_cursor: row.try_get("last_source_cursor")?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let location: StorageLocation = row.try_get::<String, _>("storage_location")?.parse()?;
    let status = row
        .try_get::<Option<String>, _>("status")?
        .map(|s| s.parse::<ItemStatus>())
        .transpose()?;
    Ok(Item {
        collection_id: row.try_get("collection_id")?,
        source_id: row.try_get("source_id")?,
        filename: row.try_get("filename")?,
        local_path: row.try_get("path")?,
        remote_ref: row.try_get("remote_ref")?,
        size: from_i64(row.try_get("size")?)?,
        sample_fingerprint: row.try_get("sample_fingerprint")?,
        full_fingerprint: row.try_get("full_fingerprint")?,
        location,
        status,
        touched_at: row.try_get("downloaded_at")?,
    })
}

fn status_from_row(row: &SqliteRow) -> Result<StatusRecord> {
    Ok(StatusRecord {
        collection_id: row.try_get("collection_id")?,
        source_id: row.try_get("source_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        reason: row.try_get("reason")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn hash_entry_from_row(row: &SqliteRow) -> Result<HashIndexEntry> {
    let size = from_i64(row.try_get("size")?)?;
    let fingerprint: String = row.try_get("fingerprint")?;
    let key: String = row.try_get("hash_key")?;
    let expected = HashKey::new(size, &fingerprint);
    if expected.as_str() != key {
        return Err(Error::integrity(format!(
            "hash index key {key:?} does not match its size and fingerprint"
        )));
    }
    let first_item = match (
        row.try_get::<Option<i64>, _>("first_collection_id")?,
        row.try_get::<Option<i64>, _>("first_source_id")?,
    ) {
        (Some(c), Some(s)) => Some(ItemRef::new(c, s)),
        _ => None,
    };
    Ok(HashIndexEntry {
        key: expected,
        size,
        fingerprint,
        first_path: row.try_get("first_path")?,
        first_item,
        created_at: row.try_get("created_at")?,
    })
}
