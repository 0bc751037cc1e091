// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the viewer program is launched.
///
/// - `Attached`: stdout/stderr are piped back and drained by an async
///   monitor (default).
/// - `Detached`: the program runs in its own process group with output
///   appended to a log file, which is followed by a log tailer. Use this for
///   viewers that background themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerMode {
    Attached,
    Detached,
}

impl Default for ViewerMode {
    fn default() -> Self {
        ViewerMode::Attached
    }
}

impl FromStr for ViewerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "attached" => Ok(ViewerMode::Attached),
            "detached" => Ok(ViewerMode::Detached),
            other => Err(format!(
                "invalid viewer mode: {other} (expected \"attached\" or \"detached\")"
            )),
        }
    }
}

impl fmt::Display for ViewerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewerMode::Attached => f.write_str("attached"),
            ViewerMode::Detached => f.write_str("detached"),
        }
    }
}

/// Pipeline stage names, used in logs, timeouts and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reconstruction,
    Training,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Reconstruction => "reconstruction",
            Stage::Training => "training",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
