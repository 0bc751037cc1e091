// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Pipeline failures never escape the driver as errors; they are converted
//! into `failed` task records. The variants below are what the driver,
//! supervisor and viewer manager produce internally and what the library
//! surface returns for synchronous calls (submission, config loading).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SplatError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Bad input, e.g. an unsupported asset type. Reported before any task
    /// is created.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The external program or its script could not be started.
    #[error("Failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    /// The external program exited non-zero. `tail` holds the last captured
    /// output lines for diagnostics.
    #[error("{label} exited with code {code}")]
    ProcessFailed {
        label: String,
        code: i32,
        tail: Vec<String>,
    },

    #[error("Stage '{stage}' timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("Viewer did not bind port {port} within {timeout:?}")]
    ViewerStartTimeout { port: u16, timeout: Duration },

    #[error("Port {port} is still held by {pids:?} after forced termination")]
    PortConflictUnresolved { port: u16, pids: Vec<u32> },

    #[error("Job pool is full ({capacity} jobs admitted)")]
    Busy { capacity: usize },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Artifact not found: {0}")]
    ArtifactMissing(PathBuf),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SplatError {
    /// Diagnostic output lines carried by the error, if any.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            SplatError::ProcessFailed { tail, .. } => tail,
            _ => &[],
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SplatError>;
