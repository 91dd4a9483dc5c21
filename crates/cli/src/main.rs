use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use mediakeep_core::config::{
    load_settings, parse_settings, save_settings, to_toml, validate_settings,
};
use mediakeep_core::model::ItemStatus;
use mediakeep_core::progress::{ProgressSink, TaskProgress};
use mediakeep_core::run_log::{RunKind, start_run_log};
use mediakeep_core::store::open_backend;
use mediakeep_core::{
    APP_NAME, Backend, Engine, Error, ErrorClass, RemoteEntry, Settings, migrate_store,
    write_groups_json,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "mediakeep")]
#[command(about = "MediaKeep CLI (deduplicating media backup state)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Emit NDJSON progress events on stdout.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Find duplicate files under a backup root.
    Scan {
        root: PathBuf,
        #[arg(long)]
        json_out: Option<PathBuf>,
    },
    /// Scan, then move redundant copies into the quarantine directory.
    Consolidate { root: PathBuf },
    /// Merge the collection directory, an optional remote listing and the stored state.
    Reconcile {
        root: PathBuf,
        #[arg(long)]
        collection: String,
        /// JSON array of `{name, relative_path, size, hash?}` objects.
        #[arg(long)]
        remote_listing: Option<PathBuf>,
    },
    /// Copy the state of the configured backend into another backend.
    Migrate {
        root: PathBuf,
        #[arg(long, value_enum)]
        to: BackendArg,
    },
    Index {
        #[command(subcommand)]
        cmd: IndexCmd,
    },
    Stats { root: PathBuf },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    /// Read TOML settings from stdin, validate and save them.
    Set,
}

#[derive(Subcommand)]
enum IndexCmd {
    /// Drop hash entries whose file no longer exists.
    Prune { root: PathBuf },
    /// Register every recorded item that still has its file.
    Rebuild { root: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Sqlite,
    Json,
}

impl From<BackendArg> for Backend {
    fn from(v: BackendArg) -> Self {
        match v {
            BackendArg::Sqlite => Backend::Sqlite,
            BackendArg::Json => Backend::Json,
        }
    }
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

struct NdjsonProgressSink {
    task_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: TaskProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "phase": p.phase,
            "filesTotal": p.files_total,
            "filesDone": p.files_done,
            "bytesDone": p.bytes_done,
            "groupsFound": p.groups_found,
        });
        println!("{line}");
    }
}

struct Ctx {
    config_dir: PathBuf,
    data_dir: PathBuf,
    json: bool,
    events: bool,
}

impl Ctx {
    fn settings(&self) -> Result<Settings, CliError> {
        load_settings(&self.config_dir).map_err(map_core_err)
    }

    async fn engine(&self, root: &Path) -> Result<Engine, CliError> {
        if !root.is_dir() {
            return Err(CliError::new(
                "input.invalid",
                format!("backup root is not a directory: {}", root.display()),
            ));
        }
        Engine::open(self.settings()?, root)
            .await
            .map_err(map_core_err)
    }

    fn print<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<(), CliError> {
        if self.json {
            let line = serde_json::to_string(value)
                .map_err(|e| CliError::new("output.encode_failed", e.to_string()))?;
            println!("{line}");
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("MEDIAKEEP_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("MEDIAKEEP_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| config_dir.clone());
    let ctx = Ctx {
        config_dir,
        data_dir,
        json: cli.json,
        events: cli.events,
    };

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&ctx),
            SettingsCmd::Set => settings_set(&ctx),
        },
        Command::Scan { root, json_out } => scan(&ctx, &root, json_out.as_deref()).await,
        Command::Consolidate { root } => consolidate(&ctx, &root).await,
        Command::Reconcile {
            root,
            collection,
            remote_listing,
        } => reconcile(&ctx, &root, &collection, remote_listing.as_deref()).await,
        Command::Migrate { root, to } => migrate(&ctx, &root, to.into()).await,
        Command::Index { cmd } => match cmd {
            IndexCmd::Prune { root } => index_prune(&ctx, &root).await,
            IndexCmd::Rebuild { root } => index_rebuild(&ctx, &root).await,
        },
        Command::Stats { root } => stats(&ctx, &root).await,
    }
}

fn settings_get(ctx: &Ctx) -> Result<(), CliError> {
    let settings = ctx.settings()?;
    validate_settings(&settings).map_err(map_core_err)?;
    if ctx.json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(ctx: &Ctx) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings =
        parse_settings(&input).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    validate_settings(&settings).map_err(map_core_err)?;
    save_settings(&ctx.config_dir, &settings).map_err(map_core_err)?;
    if ctx.json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

fn new_task_id() -> String {
    format!("tsk_{}", uuid::Uuid::new_v4())
}

fn open_run_log(
    ctx: &Ctx,
    kind: RunKind,
    task_id: &str,
) -> Result<mediakeep_core::run_log::RunLogGuard, CliError> {
    start_run_log(kind, task_id, &ctx.data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))
}

fn emit_state(ctx: &Ctx, task_id: &str, kind: &str, state: &str) {
    if ctx.events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": kind,
                "state": state,
            })
        );
    }
}

async fn scan(ctx: &Ctx, root: &Path, json_out: Option<&Path>) -> Result<(), CliError> {
    let task_id = new_task_id();
    let _log = open_run_log(ctx, RunKind::Scan, &task_id)?;
    let engine = ctx.engine(root).await?;
    emit_state(ctx, &task_id, "scan", "running");

    let sink = NdjsonProgressSink {
        task_id: task_id.clone(),
    };
    let progress: Option<&dyn ProgressSink> = if ctx.events { Some(&sink) } else { None };
    let groups = engine
        .scan_for_duplicates(None, progress, None)
        .map_err(map_core_err)?;
    if let Some(out) = json_out {
        write_groups_json(&groups, out).map_err(map_core_err)?;
    }
    emit_state(ctx, &task_id, "scan", "succeeded");

    let redundant: u64 = groups.iter().map(|g| g.total_bytes() - g.size).sum();
    ctx.print(
        &serde_json::json!({ "groups": groups, "redundantBytes": redundant }),
        || {
            let mut lines: Vec<String> = groups
                .iter()
                .map(|g| format!("size={} copies={}\n  {}", g.size, g.paths.len(), g.paths.join("\n  ")))
                .collect();
            lines.push(format!("groups={} redundantBytes={redundant}", groups.len()));
            lines.join("\n")
        },
    )
}

async fn consolidate(ctx: &Ctx, root: &Path) -> Result<(), CliError> {
    let task_id = new_task_id();
    let _log = open_run_log(ctx, RunKind::Consolidate, &task_id)?;
    let engine = ctx.engine(root).await?;
    emit_state(ctx, &task_id, "consolidate", "running");

    let sink = NdjsonProgressSink {
        task_id: task_id.clone(),
    };
    let progress: Option<&dyn ProgressSink> = if ctx.events { Some(&sink) } else { None };
    let groups = engine
        .scan_for_duplicates(None, progress, None)
        .map_err(map_core_err)?;
    let report = engine.consolidate(&groups).await.map_err(map_core_err)?;
    emit_state(ctx, &task_id, "consolidate", "succeeded");

    ctx.print(&report, || {
        format!(
            "groups={} moved={} bytesMoved={} failed={} recordsUpdated={}",
            report.groups, report.moved, report.bytes_moved, report.failed, report.records_updated
        )
    })
}

async fn reconcile(
    ctx: &Ctx,
    root: &Path,
    collection: &str,
    remote_listing: Option<&Path>,
) -> Result<(), CliError> {
    let remote: Option<Vec<RemoteEntry>> = match remote_listing {
        Some(path) => {
            let bytes = std::fs::read(path)
                .map_err(|e| CliError::new("input.read_failed", e.to_string()))?;
            let entries = serde_json::from_slice(&bytes).map_err(|e| {
                CliError::new("input.invalid", e.to_string())
                    .with_details(serde_json::json!({ "path": path.display().to_string() }))
            })?;
            Some(entries)
        }
        None => None,
    };

    let task_id = new_task_id();
    let _log = open_run_log(ctx, RunKind::Reconcile, &task_id)?;
    let engine = ctx.engine(root).await?;
    emit_state(ctx, &task_id, "reconcile", "running");
    let report = engine
        .reconcile(collection, remote.as_deref())
        .await
        .map_err(map_core_err)?;
    emit_state(ctx, &task_id, "reconcile", "succeeded");

    ctx.print(&report, || {
        format!(
            "localOnly={} remoteOnly={} both={} missing={} ambiguous={} unresolved={} changed={}",
            report.local_only,
            report.remote_only,
            report.both,
            report.missing_marked,
            report.ambiguous,
            report.unresolved,
            report.changed
        )
    })
}

async fn migrate(ctx: &Ctx, root: &Path, to: Backend) -> Result<(), CliError> {
    let settings = ctx.settings()?;
    if settings.storage.backend == to {
        return Err(CliError::new(
            "input.invalid",
            "target backend is already the configured backend",
        ));
    }
    let task_id = new_task_id();
    let _log = open_run_log(ctx, RunKind::Migrate, &task_id)?;
    let from = open_backend(settings.storage.backend, &settings, root)
        .await
        .map_err(map_core_err)?;
    let target = open_backend(to, &settings, root)
        .await
        .map_err(map_core_err)?;
    let report = migrate_store(&*from, &*target)
        .await
        .map_err(map_core_err)?;

    ctx.print(&report, || {
        format!(
            "collections={} items={} statuses={} duplicatesInserted={} hashEntriesInserted={}",
            report.collections,
            report.items,
            report.statuses,
            report.duplicates_inserted,
            report.hash_entries_inserted
        )
    })
}

async fn index_prune(ctx: &Ctx, root: &Path) -> Result<(), CliError> {
    let engine = ctx.engine(root).await?;
    let removed = engine.dedup().prune().await.map_err(map_core_err)?;
    ctx.print(&serde_json::json!({ "removed": removed }), || {
        format!("removed={removed}")
    })
}

async fn index_rebuild(ctx: &Ctx, root: &Path) -> Result<(), CliError> {
    let engine = ctx.engine(root).await?;
    let registered = engine
        .dedup()
        .rebuild_from_items(None)
        .await
        .map_err(map_core_err)?;
    ctx.print(&serde_json::json!({ "registered": registered }), || {
        format!("registered={registered}")
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CollectionStats {
    id: i64,
    name: String,
    completed: bool,
    total_files: u64,
    total_bytes: u64,
    statuses: std::collections::BTreeMap<String, u64>,
}

async fn stats(ctx: &Ctx, root: &Path) -> Result<(), CliError> {
    let engine = ctx.engine(root).await?;
    let store = engine.store();
    let mut out = Vec::new();
    for c in store.list_collections().await.map_err(map_core_err)? {
        let counts = store.status_counts(c.id).await.map_err(map_core_err)?;
        out.push(CollectionStats {
            id: c.id,
            name: c.name,
            completed: c.completed,
            total_files: c.total_files,
            total_bytes: c.total_bytes,
            statuses: ItemStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
                .collect(),
        });
    }
    let hash_entries = store.list_hash_entries().await.map_err(map_core_err)?.len();

    ctx.print(
        &serde_json::json!({ "collections": out, "hashEntries": hash_entries }),
        || {
            let mut lines: Vec<String> = out
                .iter()
                .map(|c| {
                    let statuses: Vec<String> =
                        c.statuses.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    format!(
                        "{} files={} bytes={} completed={} {}",
                        c.name,
                        c.total_files,
                        c.total_bytes,
                        c.completed,
                        statuses.join(" ")
                    )
                })
                .collect();
            lines.push(format!("hashEntries={hash_entries}"));
            lines.join("\n")
        },
    )
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME.to_lowercase())
}

fn map_core_err(e: Error) -> CliError {
    let retryable = matches!(
        e.class(),
        ErrorClass::Transient | ErrorClass::RateLimited(_) | ErrorClass::CorruptResult
    );
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::InvalidInput { message } => CliError::new("input.invalid", message),
        Error::StateIntegrity { message } => CliError::new("state.integrity", message),
        err @ Error::StateWrite { .. } => CliError::new("state.write_failed", err.to_string()),
        Error::RateLimited { seconds } => {
            CliError::retryable("source.rate_limited", format!("rate limited for {seconds}s"))
                .with_details(serde_json::json!({ "seconds": seconds }))
        }
        Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        Error::Sqlite(e) => CliError::new("db.failed", e.to_string()),
        Error::SqliteMigrate(e) => CliError::new("db.migrate_failed", e.to_string()),
        other if retryable => CliError::retryable("io.transient", other.to_string()),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
