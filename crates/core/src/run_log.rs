use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::info;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::sanitize_filename;

const DEFAULT_DIRECTIVE: &str = "debug";

/// Operations that get their own NDJSON log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Backup,
    Scan,
    Consolidate,
    Reconcile,
    Migrate,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Backup => "backup",
            RunKind::Scan => "scan",
            RunKind::Consolidate => "consolidate",
            RunKind::Reconcile => "reconcile",
            RunKind::Migrate => "migrate",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "backup" => RunKind::Backup,
            "scan" => RunKind::Scan,
            "consolidate" => RunKind::Consolidate,
            "reconcile" => RunKind::Reconcile,
            "migrate" => RunKind::Migrate,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unknown run kind: {other}"),
                ));
            }
        })
    }
}

/// Process-wide sink for the JSON tracing layer; holds the file of the run in progress.
#[derive(Debug, Default)]
struct RunSink {
    file: Mutex<Option<BufWriter<File>>>,
}

impl RunSink {
    fn file(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, path: &Path) -> std::io::Result<()> {
        let mut file = self.file();
        if file.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a run log is already open in this process",
            ));
        }
        let f = OpenOptions::new().create_new(true).write(true).open(path)?;
        *file = Some(BufWriter::new(f));
        Ok(())
    }

    fn detach(&self) -> std::io::Result<()> {
        let Some(mut w) = self.file().take() else {
            return Ok(());
        };
        w.flush()?;
        w.get_ref().sync_all()
    }
}

/// Writes into the attached file; lines emitted while no run is open are discarded.
struct SinkWriter<'a>(MutexGuard<'a, Option<BufWriter<File>>>);

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.as_mut().map_or(Ok(()), |w| w.flush())
    }
}

impl<'a> MakeWriter<'a> for RunSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter(self.file())
    }
}

impl<'a> MakeWriter<'a> for &RunSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

static SINK: OnceLock<RunSink> = OnceLock::new();
static SUBSCRIBER: OnceLock<()> = OnceLock::new();

fn sink() -> &'static RunSink {
    SINK.get_or_init(RunSink::default)
}

/// First directive that parses wins; unparsable overrides fall through to the next one.
fn pick_filter(candidates: &[Option<&str>]) -> EnvFilter {
    candidates
        .iter()
        .flatten()
        .find_map(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Installs the JSON subscriber once per process. `MEDIAKEEP_LOG` beats `RUST_LOG`.
pub fn init_run_logging() {
    SUBSCRIBER.get_or_init(|| {
        let own = std::env::var("MEDIAKEEP_LOG").ok();
        let rust = std::env::var("RUST_LOG").ok();
        let filter = pick_filter(&[own.as_deref(), rust.as_deref()]);

        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(sink());
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .try_init();
    });
}

/// Closes the run log on drop, after a final `run_log.close` line.
pub struct RunLogGuard {
    path: PathBuf,
    kind: RunKind,
    run_id: String,
    opened: Instant,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        info!(
            event = "run_log.close",
            kind = %self.kind,
            run_id = %self.run_id,
            elapsed_ms = self.opened.elapsed().as_millis() as u64,
            "run_log.close"
        );
        let _ = sink().detach();
    }
}

/// Routes tracing output into `<logs>/run-<kind>-<utc>-<run_id>.ndjson`.
///
/// `<logs>` is `MEDIAKEEP_LOG_DIR` when set, else `<data_dir>/logs`. One run log per process.
pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_run_logging();

    let dir = std::env::var_os("MEDIAKEEP_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"));
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!(
        "run-{kind}-{}-{}.ndjson",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename(run_id).replace(' ', "_")
    ));
    sink().attach(&path)?;
    info!(event = "run_log.open", kind = %kind, run_id, "run_log.open");

    Ok(RunLogGuard {
        path,
        kind,
        run_id: run_id.to_string(),
        opened: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_skips_unparsable_overrides() {
        assert_eq!(pick_filter(&[Some("info"), Some("warn")]).to_string(), "info");
        assert_eq!(pick_filter(&[None, Some("warn")]).to_string(), "warn");
        assert_eq!(pick_filter(&[Some("mediakeep=loud"), Some("warn")]).to_string(), "warn");
        assert_eq!(pick_filter(&[None, None]).to_string(), "debug");
    }

    #[test]
    fn kinds_parse_from_their_names() {
        for kind in [
            RunKind::Backup,
            RunKind::Scan,
            RunKind::Consolidate,
            RunKind::Reconcile,
            RunKind::Migrate,
        ] {
            assert_eq!(kind.as_str().parse::<RunKind>().unwrap(), kind);
        }
        let err = "restore".parse::<RunKind>().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn run_log_is_bracketed_ndjson() {
        let temp = tempfile::tempdir().unwrap();
        let guard = start_run_log(RunKind::Scan, "tsk 1", temp.path()).unwrap();
        assert_eq!(guard.path().parent(), Some(temp.path().join("logs").as_path()));
        let name = guard.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("run-scan-"), "{name}");
        assert!(name.ends_with("-tsk_1.ndjson"), "{name}");

        assert!(start_run_log(RunKind::Scan, "again", temp.path()).is_err());

        tracing::info!(event = "scan.finish", groups = 2, "scan.finish");
        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).unwrap();
        let events: Vec<String> = text
            .lines()
            .map(|line| {
                let v: serde_json::Value = serde_json::from_str(line).unwrap();
                assert!(v.get("timestamp").is_some());
                v["fields"]["event"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        for expected in ["run_log.open", "scan.finish", "run_log.close"] {
            assert!(events.iter().any(|e| e == expected), "{expected} missing");
        }
    }
}
