// src/registry/task.rs

//! Task record and its state machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline status of a task.
///
/// Happy path: `Uploading → Uploaded → Processing → Training → Completed`.
/// `Failed` is reachable from every non-terminal state. Nothing leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Uploading,
    Uploaded,
    Processing,
    Training,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` goes back along the happy path.
    /// `Failed` is never a backward move.
    pub fn is_backward_to(&self, next: TaskStatus) -> bool {
        match (self.happy_path_index(), next.happy_path_index()) {
            (Some(current), Some(next)) => next < current,
            _ => false,
        }
    }

    fn happy_path_index(&self) -> Option<u8> {
        match self {
            TaskStatus::Uploading => Some(0),
            TaskStatus::Uploaded => Some(1),
            TaskStatus::Processing => Some(2),
            TaskStatus::Training => Some(3),
            TaskStatus::Completed => Some(4),
            TaskStatus::Failed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Uploading => "uploading",
            TaskStatus::Uploaded => "uploaded",
            TaskStatus::Processing => "processing",
            TaskStatus::Training => "training",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "uploading" => Ok(TaskStatus::Uploading),
            "uploaded" => Ok(TaskStatus::Uploaded),
            "processing" => Ok(TaskStatus::Processing),
            "training" => Ok(TaskStatus::Training),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Payload of a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Trained point-cloud artifact (`.ply`).
    pub artifact_path: PathBuf,
    pub owner: String,
    /// Name derived from the submitted asset (its sanitised file stem).
    pub filename: String,
}

/// One tracked pipeline run for one submitted asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub message: String,
    /// Percent, 0..=100.
    pub progress: u8,
    /// Only present once `status == Completed`.
    pub result: Option<TaskResult>,
    /// Last output lines of a failed external process.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(id: String, status: TaskStatus, message: String, progress: u8) -> Self {
        let now = Utc::now();
        Self {
            id,
            status,
            message,
            progress: progress.min(100),
            result: None,
            diagnostics: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Owner token of this task (the part of the id before the last `_`).
    pub fn owner(&self) -> Option<&str> {
        owner_of(&self.id)
    }
}

/// Build a task id from its owner and a millisecond timestamp.
pub fn task_id(owner: &str, millis: i64) -> String {
    format!("{owner}_{millis}")
}

/// Extract the owner token from a `<owner>_<timestamp>` id.
pub fn owner_of(id: &str) -> Option<&str> {
    let (owner, stamp) = id.rsplit_once('_')?;
    if owner.is_empty() || stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(owner)
}

/// Whether `id` is a task id belonging to `owner`.
///
/// The id must be exactly `<owner>_<digits>`, so owner `"a"` does not match
/// ids of owner `"a_b"`.
pub fn id_belongs_to(id: &str, owner: &str) -> bool {
    match id.strip_prefix(owner).and_then(|rest| rest.strip_prefix('_')) {
        Some(stamp) => !stamp.is_empty() && stamp.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}
