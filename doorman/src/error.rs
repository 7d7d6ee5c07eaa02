//! Error types for the listener.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Failures while loading or validating configuration. All of them abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid port spec '{0}' (expected 'port' or 'port/proto')")]
    PortSpec(String),

    #[error("invalid config value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate client name '{0}'")]
    DuplicateClient(String),
}

/// Failures of the capture pipeline. These are resource lifecycle problems and
/// are fatal to the event loop.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open capture output {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        source: std::io::Error,
    },

    #[error("failed to query capture process: {0}")]
    Wait(std::io::Error),

    #[error("capture process exited ({status}): {stderr}")]
    Exited { status: ExitStatus, stderr: String },

    #[error("failed to follow {path}: {source}")]
    Tail {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A knock count outside the supported range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "knock count {0} out of range [{}, {}]; using {}",
    crate::sequence::MIN_KNOCKS,
    crate::sequence::MAX_KNOCKS,
    crate::sequence::DEFAULT_KNOCKS
)]
pub struct KnockCountError(pub i64);

/// Top-level error returned by the orchestrator loop.
#[derive(Debug, Error)]
pub enum DoormanError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("shutdown requested")]
    Shutdown,
}
