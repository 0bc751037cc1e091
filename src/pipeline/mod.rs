// src/pipeline/mod.rs

//! The ingest → reconstruction → training pipeline.
//!
//! - [`ingest`] validates and copies submitted videos into the data dir.
//! - [`driver`] runs one pass per task and maps stage outcomes onto the
//!   [`TaskRegistry`].
//! - [`pool`] bounds admission and concurrency of pipeline runs.
//! - [`reconstruction`] / [`training`] are the process-backed stage engines.
//!
//! The stage engines sit behind the [`ReconstructionEngine`] and
//! [`TrainingEngine`] traits so tests can swap in fakes that never spawn a
//! process.

pub mod driver;
pub mod ingest;
pub mod pool;
pub mod reconstruction;
pub(crate) mod stage;
pub mod training;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tracing::trace;

use crate::errors::Result;
use crate::registry::{TaskRegistry, TaskStatus};

pub use driver::{PipelineDriver, PipelineJob};
pub use ingest::{secure_filename, validate_owner, AssetCandidate, AssetIngest, IngestedAsset};
pub use pool::{JobPool, JobTicket};
pub use reconstruction::ProcessReconstruction;
pub use training::{find_artifact, ProcessTraining};

/// Boxed future returned by stage engines.
pub type StageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Input to the reconstruction stage.
#[derive(Debug, Clone)]
pub struct ReconstructionRequest {
    pub video_path: PathBuf,
    /// Per-job directory (`<data_dir>/<owner>/<name>`).
    pub job_dir: PathBuf,
}

/// What the reconstruction stage produced.
#[derive(Debug, Clone)]
pub struct ReconstructionOutput {
    /// Directory handed to training as its source (`<job_dir>/colmap`).
    pub workspace: PathBuf,
    pub images_dir: PathBuf,
    /// Sparse model directory. An empty directory is treated as a failure.
    pub model_dir: PathBuf,
}

/// Input to the training stage.
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub iterations: u32,
}

/// What the training stage produced.
#[derive(Debug, Clone)]
pub struct TrainingOutput {
    /// Trained point cloud (`.ply`).
    pub artifact_path: PathBuf,
    pub output_dir: PathBuf,
    /// Last lines of trainer output.
    pub log_tail: Vec<String>,
}

/// Turns a video into a sparse reconstruction.
pub trait ReconstructionEngine: Send + Sync {
    fn reconstruct<'a>(
        &'a self,
        request: &'a ReconstructionRequest,
    ) -> StageFuture<'a, ReconstructionOutput>;
}

/// Trains a splat model from a reconstruction workspace.
pub trait TrainingEngine: Send + Sync {
    fn train<'a>(
        &'a self,
        request: &'a TrainingRequest,
        progress: StageProgress,
    ) -> StageFuture<'a, TrainingOutput>;
}

/// Lets a running stage push intermediate progress into the registry.
///
/// A stage reports 0..=100 of its own work; that is mapped linearly onto
/// the task-level range `[floor, ceiling]`.
#[derive(Debug, Clone)]
pub struct StageProgress {
    target: Option<(TaskRegistry, String)>,
    status: TaskStatus,
    label: &'static str,
    floor: u8,
    ceiling: u8,
}

impl StageProgress {
    pub fn new(
        registry: TaskRegistry,
        task_id: impl Into<String>,
        status: TaskStatus,
        label: &'static str,
        floor: u8,
        ceiling: u8,
    ) -> Self {
        Self {
            target: Some((registry, task_id.into())),
            status,
            label,
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    /// A reporter that discards everything.
    pub fn noop() -> Self {
        Self {
            target: None,
            status: TaskStatus::Training,
            label: "stage",
            floor: 0,
            ceiling: 0,
        }
    }

    /// Task-level progress for a stage-level percentage.
    pub fn scaled(&self, percent: u8) -> u8 {
        let span = u32::from(self.ceiling - self.floor);
        let scaled = u32::from(self.floor) + span * u32::from(percent.min(100)) / 100;
        scaled as u8
    }

    pub fn report(&self, percent: u8) {
        let Some((registry, task_id)) = &self.target else {
            return;
        };
        let progress = self.scaled(percent);
        trace!(task = %task_id, percent, progress, "stage progress");
        registry.update(
            task_id,
            self.status,
            format!("{} ({}%)", self.label, percent.min(100)),
            progress,
            None,
        );
    }
}
