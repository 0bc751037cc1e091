// src/registry/mod.rs

//! In-memory task registry.
//!
//! The registry is the single source of truth for pipeline progress. It is
//! cheap to clone (all clones share one map behind one `RwLock`), so every
//! pipeline worker and every status reader holds its own handle. Writes are
//! visible to readers as soon as the write lock is released.
//!
//! Rules enforced here rather than by callers:
//! - terminal tasks (`completed` / `failed`) are never mutated again;
//! - progress never decreases, except that a failure while still
//!   `uploading` may report a lower value (upload failures report 0);
//! - `result` is only kept on `completed`.

pub mod task;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::errors::{Result, SplatError};

pub use task::{id_belongs_to, owner_of, task_id, Task, TaskResult, TaskStatus};

/// What an `update` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The id was unseen; a record was created.
    Inserted,
    Updated,
    /// The task was already terminal; nothing changed.
    IgnoredTerminal,
}

/// Shared, thread-safe task registry.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    /// Last millisecond stamp handed out by `next_id`.
    last_stamp: Arc<AtomicI64>,
    events: broadcast::Sender<Task>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            last_stamp: Arc::new(AtomicI64::new(0)),
            events,
        }
    }

    /// Build a fresh `<owner>_<millis>` id.
    ///
    /// The stamp is the current Unix time in milliseconds, bumped past the
    /// previously issued stamp so two submissions in the same millisecond
    /// still get distinct ids.
    pub fn next_id(&self, owner: &str) -> String {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_stamp.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return task_id(owner, next),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Insert a task if `id` is not present yet. Returns `true` if inserted.
    pub fn create(&self, id: &str, status: TaskStatus, message: impl Into<String>, progress: u8) -> bool {
        let snapshot = {
            let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            if tasks.contains_key(id) {
                debug!(task = %id, "create ignored; task already exists");
                return false;
            }
            let task = Task::new(id.to_string(), status, message.into(), progress);
            tasks.insert(id.to_string(), task.clone());
            task
        };
        debug!(task = %id, status = %snapshot.status, progress = snapshot.progress, "task created");
        let _ = self.events.send(snapshot);
        true
    }

    /// Upsert a task's status, message and progress.
    ///
    /// Never fails on a missing id: an unseen id is inserted. Updates to a
    /// terminal task are ignored.
    pub fn update(
        &self,
        id: &str,
        status: TaskStatus,
        message: impl Into<String>,
        progress: u8,
        result: Option<TaskResult>,
    ) -> UpdateOutcome {
        self.apply(id, status, message.into(), Some(progress), result, None)
    }

    /// Mark a task `failed`, keeping its current progress and recording
    /// diagnostic output lines.
    pub fn fail(
        &self,
        id: &str,
        message: impl Into<String>,
        diagnostics: Vec<String>,
    ) -> UpdateOutcome {
        self.apply(
            id,
            TaskStatus::Failed,
            message.into(),
            None,
            None,
            Some(diagnostics),
        )
    }

    fn apply(
        &self,
        id: &str,
        status: TaskStatus,
        message: String,
        progress: Option<u8>,
        result: Option<TaskResult>,
        diagnostics: Option<Vec<String>>,
    ) -> UpdateOutcome {
        let (outcome, snapshot) = {
            let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            match tasks.get_mut(id) {
                None => {
                    let mut task =
                        Task::new(id.to_string(), status, message, progress.unwrap_or(0));
                    if status == TaskStatus::Completed {
                        task.result = result;
                    }
                    if let Some(lines) = diagnostics {
                        task.diagnostics = lines;
                    }
                    tasks.insert(id.to_string(), task.clone());
                    (UpdateOutcome::Inserted, task)
                }
                Some(task) if task.is_terminal() => {
                    debug!(
                        task = %id,
                        current = %task.status,
                        requested = %status,
                        "ignoring update to terminal task"
                    );
                    return UpdateOutcome::IgnoredTerminal;
                }
                Some(task) => {
                    if task.status.is_backward_to(status) {
                        debug!(
                            task = %id,
                            current = %task.status,
                            requested = %status,
                            "task status moving backwards"
                        );
                    }
                    let requested = progress.unwrap_or(task.progress).min(100);
                    let upload_failure =
                        status == TaskStatus::Failed && task.status == TaskStatus::Uploading;
                    task.progress = if upload_failure {
                        requested
                    } else {
                        task.progress.max(requested)
                    };
                    task.status = status;
                    task.message = message;
                    task.result = if status == TaskStatus::Completed {
                        result
                    } else {
                        None
                    };
                    if let Some(lines) = diagnostics {
                        task.diagnostics = lines;
                    }
                    task.updated_at = Utc::now().max(task.updated_at);
                    (UpdateOutcome::Updated, task.clone())
                }
            }
        };

        trace!(
            task = %id,
            status = %snapshot.status,
            progress = snapshot.progress,
            message = %snapshot.message,
            "task updated"
        );
        let _ = self.events.send(snapshot);
        outcome
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &str) -> Option<Task> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.get(id).cloned()
    }

    /// Like [`get`](Self::get) but maps a missing id to `TaskNotFound`.
    pub fn require(&self, id: &str) -> Result<Task> {
        self.get(id)
            .ok_or_else(|| SplatError::TaskNotFound(id.to_string()))
    }

    /// All tasks whose id is `<owner>_<timestamp>`, oldest first.
    pub fn list_for(&self, owner: &str) -> Vec<Task> {
        let mut found: Vec<Task> = {
            let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
            tasks
                .values()
                .filter(|t| id_belongs_to(&t.id, owner))
                .cloned()
                .collect()
        };
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        found
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive a snapshot of every task after each applied change.
    ///
    /// Slow receivers may observe `RecvError::Lagged`; the registry itself
    /// remains authoritative.
    pub fn subscribe(&self) -> broadcast::Receiver<Task> {
        self.events.subscribe()
    }
}
