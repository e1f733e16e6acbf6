use std::path::PathBuf;

use thiserror::Error;

/// Closed error vocabulary for the four core subsystems (see the error
/// handling design). `anyhow` wraps these at the process boundary in
/// `main`; inside the subsystems the concrete variant is matched on to
/// decide whether a failure aborts startup or is merely logged.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid configuration: key `{key}`: {reason}")]
    Config { key: String, reason: String },

    #[error("environment check failed: {check}: {reason}")]
    Environment { check: String, reason: String },

    #[error("failed to load monitor `{monitor}`: {reason}")]
    Load { monitor: String, reason: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transient drain error on `{monitor}`: key raced with delete, skipped")]
    TransientDrain { monitor: String },

    #[error("shutdown requested before start completed for `{monitor}`")]
    ShutdownRace { monitor: String },

    #[error("pid file `{path}` is held by another daemon instance")]
    PidFileConflict { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, MonitorError>;
