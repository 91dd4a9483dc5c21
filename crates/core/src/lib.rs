pub mod config;
mod consolidate;
mod dedup_index;
mod engine;
mod error;
pub mod fingerprint;
pub mod mirror;
pub mod model;
pub mod paths;
pub mod progress;
mod reconcile;
pub mod resume;
pub mod retry;
pub mod run_log;
mod scanner;
pub mod source;
pub mod store;

pub const APP_NAME: &str = "MediaKeep";

pub use config::{Backend, Settings};
pub use consolidate::{ConsolidationReport, consolidate};
pub use dedup_index::{DedupDecision, DedupIndex, HashHit};
pub use engine::{
    DownloadOutcome, Engine, ResumeReport, RunOptions, RunSummary, TransferMode, TransferReport,
};
pub use error::{Error, ErrorClass, Result};
pub use reconcile::{
    LocalEntry, REASON_BOTH, REASON_LOCAL, REASON_MISSING, REASON_REMOTE, ReconciliationReport,
    RemoteEntry, list_local, reconcile,
};
pub use scanner::{DuplicateGroup, ScanOptions, scan_for_duplicates, write_groups_json};
pub use store::{ItemStore, JsonItemStore, MigrationReport, SqliteItemStore, migrate_store, open_store};
