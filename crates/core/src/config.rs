use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::fingerprint::DEFAULT_SAMPLE_BYTES;
use crate::paths::write_atomic;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub layout: LayoutSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub backend: Backend,
    pub db_file: String,
    pub state_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupSettings {
    pub sample_bytes: u64,
    pub full_hash_on_scan: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub concurrency: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSettings {
    pub quarantine_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSettings {
    pub min_interval_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            db_file: ".mediakeep.sqlite".to_string(),
            state_dir: ".state".to_string(),
        }
    }
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            sample_bytes: DEFAULT_SAMPLE_BYTES,
            full_hash_on_scan: true,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { concurrency: 3 }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
        }
    }
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            quarantine_dir: "duplicates".to_string(),
        }
    }
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            storage: StorageSettings::default(),
            dedup: DedupSettings::default(),
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
            layout: LayoutSettings::default(),
            progress: ProgressSettings::default(),
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl ProgressSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Settings {
    pub fn db_path(&self, root: &Path) -> PathBuf {
        root.join(&self.storage.db_file)
    }

    pub fn state_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.storage.state_dir)
    }

    pub fn quarantine_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.layout.quarantine_dir)
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings version")),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;
    write_atomic(&config_path(config_dir), text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }
    if settings.pool.concurrency < 1 {
        return Err(Error::InvalidConfig {
            message: "pool.concurrency must be >= 1".to_string(),
        });
    }
    if settings.retry.max_attempts < 1 {
        return Err(Error::InvalidConfig {
            message: "retry.max_attempts must be >= 1".to_string(),
        });
    }
    if settings.dedup.sample_bytes < 1 {
        return Err(Error::InvalidConfig {
            message: "dedup.sample_bytes must be >= 1".to_string(),
        });
    }
    if settings.storage.db_file.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "storage.db_file must not be empty".to_string(),
        });
    }
    if settings.storage.state_dir.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "storage.state_dir must not be empty".to_string(),
        });
    }

    let quarantine = Path::new(&settings.layout.quarantine_dir);
    let mut comps = quarantine.components();
    let single_normal = matches!(comps.next(), Some(Component::Normal(_))) && comps.next().is_none();
    if !single_normal {
        return Err(Error::InvalidConfig {
            message: format!(
                "layout.quarantine_dir must be a single relative directory name (got {:?})",
                settings.layout.quarantine_dir
            ),
        });
    }
    Ok(())
}
