use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },

    #[error("transient io error: {message}")]
    TransientIo { message: String },

    #[error("rate limited: retry after {seconds}s")]
    RateLimited { seconds: u64 },

    #[error("corrupt result (zero bytes): {path:?}")]
    CorruptResult { path: PathBuf },

    #[error("source reference no longer valid: {message}")]
    PermanentSource { message: String },

    #[error("state integrity error: {message}")]
    StateIntegrity { message: String },

    #[error("state write failed: {path:?}: {source}")]
    StateWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ambiguous basename {basename:?} matches {candidates} records")]
    ReconciliationAmbiguity { basename: String, candidates: usize },

    #[error("cancelled")]
    Cancelled,
}

/// How a caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff, counts against the attempt cap.
    Transient,
    /// Sleep exactly this many seconds, then retry without consuming an attempt.
    RateLimited(u64),
    /// Discard the partial result and retry within the cap.
    CorruptResult,
    /// Record the item as failed, never retry.
    Permanent,
    /// Abort the run and surface the error unchanged.
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::TransientIo { .. } | Error::Io(_) => ErrorClass::Transient,
            Error::RateLimited { seconds } => ErrorClass::RateLimited(*seconds),
            Error::CorruptResult { .. } => ErrorClass::CorruptResult,
            Error::PermanentSource { .. }
            | Error::ReconciliationAmbiguity { .. }
            | Error::InvalidInput { .. }
            | Error::NonUtf8Path { .. } => ErrorClass::Permanent,
            Error::Sqlite(_)
            | Error::SqliteMigrate(_)
            | Error::Json(_)
            | Error::StateIntegrity { .. }
            | Error::StateWrite { .. }
            | Error::InvalidConfig { .. }
            | Error::Walkdir(_)
            | Error::Cancelled => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub(crate) fn integrity(message: impl Into<String>) -> Self {
        Error::StateIntegrity {
            message: message.into(),
        }
    }
}
