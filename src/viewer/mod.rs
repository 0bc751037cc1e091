// src/viewer/mod.rs

//! Interactive viewer sessions.
//!
//! At most one viewer runs at a time, bound to the configured port. See
//! [`ViewerSessionManager`] for the start/stop protocol.

pub mod session;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::{ConfigFile, LauncherConfig};
use crate::types::ViewerMode;

pub use session::ViewerSessionManager;

/// Outcome of [`ViewerSessionManager::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SessionStart {
    /// The viewer is listening.
    Started { url: String, pid: u32 },
    /// No viewer program is installed; `url` points at a placeholder page.
    Simulated { url: String, reason: String },
    /// Launch failed. `fallback_url` points at the demo viewer.
    Failed { reason: String, fallback_url: String },
}

impl SessionStart {
    /// The URL to hand to a client, whatever the outcome.
    pub fn url(&self) -> &str {
        match self {
            SessionStart::Started { url, .. } | SessionStart::Simulated { url, .. } => url,
            SessionStart::Failed { fallback_url, .. } => fallback_url,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, SessionStart::Started { .. })
    }
}

/// Snapshot returned by [`ViewerSessionManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// Something is listening on the viewer port right now.
    pub running: bool,
    pub port: u16,
    pub url: Option<String>,
    pub artifact: Option<PathBuf>,
    pub pid: Option<u32>,
    pub recent_log_lines: Vec<String>,
}

/// Viewer settings resolved from [`ConfigFile`].
#[derive(Debug, Clone)]
pub struct ViewerSettings {
    pub launcher: LauncherConfig,
    pub port: u16,
    /// Passed to the viewer as `--host`.
    pub bind_host: String,
    /// Used in URLs handed to clients.
    pub public_host: String,
    pub mode: ViewerMode,
    pub log_file: PathBuf,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub recent_lines: usize,
}

impl ViewerSettings {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            launcher: cfg.viewer.launcher.clone(),
            port: cfg.viewer.port,
            bind_host: cfg.viewer_host().to_string(),
            public_host: cfg.public_host().to_string(),
            mode: cfg.viewer.mode,
            log_file: cfg.viewer_log_file(),
            startup_timeout: cfg.viewer.startup_timeout,
            stop_grace: cfg.viewer.stop_grace,
            recent_lines: cfg.viewer.recent_lines,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.public_host, self.port)
    }

    pub fn simulated_url(&self, artifact: &Path) -> String {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/viewer?ply={}", self.base_url(), name)
    }

    pub fn fallback_url(&self) -> String {
        format!("{}/demo-viewer", self.base_url())
    }

    /// Why the viewer cannot actually be launched, if it cannot.
    pub fn missing_program(&self) -> Option<String> {
        match (&self.launcher.program, &self.launcher.script) {
            (Some(_), _) => None,
            (None, Some(script)) if script.is_file() => None,
            (None, Some(script)) => Some(format!(
                "viewer script {} not found",
                script.display()
            )),
            (None, None) => Some("no viewer program or script configured".to_string()),
        }
    }
}
