use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub type CollectionId = i64;
pub type SourceId = i64;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Identity of an item: unique source id within one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemRef {
    pub collection_id: CollectionId,
    pub source_id: SourceId,
}

impl ItemRef {
    pub fn new(collection_id: CollectionId, source_id: SourceId) -> Self {
        Self {
            collection_id,
            source_id,
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection_id, self.source_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Downloaded,
    Skipped,
    Failed,
    Duplicate,
    Missing,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Downloaded,
        ItemStatus::Skipped,
        ItemStatus::Failed,
        ItemStatus::Duplicate,
        ItemStatus::Missing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Downloaded => "downloaded",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Failed => "failed",
            ItemStatus::Duplicate => "duplicate",
            ItemStatus::Missing => "missing",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ItemStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::integrity(format!("unknown item status: {s:?}")))
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    #[default]
    Local,
    Remote,
    Both,
    Missing,
}

impl StorageLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageLocation::Local => "local",
            StorageLocation::Remote => "remote",
            StorageLocation::Both => "both",
            StorageLocation::Missing => "missing",
        }
    }

    pub fn from_presence(local: bool, remote: bool) -> Self {
        match (local, remote) {
            (true, true) => StorageLocation::Both,
            (true, false) => StorageLocation::Local,
            (false, true) => StorageLocation::Remote,
            (false, false) => StorageLocation::Missing,
        }
    }
}

impl FromStr for StorageLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(StorageLocation::Local),
            "remote" => Ok(StorageLocation::Remote),
            "both" => Ok(StorageLocation::Both),
            "missing" => Ok(StorageLocation::Missing),
            other => Err(Error::integrity(format!(
                "unknown storage location: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub name_hash: String,
    pub started_at: String,
    pub last_updated: String,
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<String>,
    pub total_files: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub last_source_cursor: Option<SourceId>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionUpdate {
    pub completed: Option<bool>,
    pub last_source_cursor: Option<SourceId>,
}

/// Mutable attributes of an item; an upsert replaces all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAttrs {
    pub filename: Option<String>,
    pub local_path: Option<String>,
    pub remote_ref: Option<String>,
    pub size: u64,
    pub sample_fingerprint: Option<String>,
    pub full_fingerprint: Option<String>,
    pub location: StorageLocation,
    /// Explicit touch time, used when importing records; `None` means now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touched_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub collection_id: CollectionId,
    pub source_id: SourceId,
    pub filename: Option<String>,
    pub local_path: Option<String>,
    pub remote_ref: Option<String>,
    pub size: u64,
    pub sample_fingerprint: Option<String>,
    pub full_fingerprint: Option<String>,
    pub location: StorageLocation,
    #[serde(default)]
    pub status: Option<ItemStatus>,
    pub touched_at: String,
}

impl Item {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.collection_id, self.source_id)
    }

    /// Attributes as they would be written back, without the touch time.
    pub fn attrs(&self) -> ItemAttrs {
        ItemAttrs {
            filename: self.filename.clone(),
            local_path: self.local_path.clone(),
            remote_ref: self.remote_ref.clone(),
            size: self.size,
            sample_fingerprint: self.sample_fingerprint.clone(),
            full_fingerprint: self.full_fingerprint.clone(),
            location: self.location,
            touched_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub collection_id: CollectionId,
    pub source_id: SourceId,
    pub status: ItemStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateLink {
    pub collection_id: CollectionId,
    pub source_id: SourceId,
    pub canonical: ItemRef,
    pub detected_at: String,
}

/// `"size:fingerprint"`, the primary key of the global hash index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashKey(String);

impl HashKey {
    pub fn new(size: u64, fingerprint: &str) -> Self {
        Self(format!("{size}:{fingerprint}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashIndexEntry {
    pub key: HashKey,
    pub size: u64,
    pub fingerprint: String,
    pub first_path: String,
    #[serde(default)]
    pub first_item: Option<ItemRef>,
    pub created_at: String,
}

impl HashIndexEntry {
    pub fn new(size: u64, fingerprint: &str, path: &str, item: Option<ItemRef>) -> Self {
        Self {
            key: HashKey::new(size, fingerprint),
            size,
            fingerprint: fingerprint.to_string(),
            first_path: path.to_string(),
            first_item: item,
            created_at: now_rfc3339(),
        }
    }
}
