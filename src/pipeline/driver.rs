// src/pipeline/driver.rs

//! One pipeline pass per task.
//!
//! The driver never returns an error: every stage failure becomes a
//! `failed` registry record, and the final status is returned so callers can
//! log or count it.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::errors::SplatError;
use crate::exec::DIAGNOSTIC_LINES;
use crate::pipeline::ingest::IngestedAsset;
use crate::pipeline::reconstruction::count_entries;
use crate::pipeline::{
    ReconstructionEngine, ReconstructionRequest, StageProgress, TrainingEngine, TrainingRequest,
};
use crate::registry::{TaskRegistry, TaskResult, TaskStatus};

pub const PROGRESS_PROCESSING: u8 = 30;
pub const PROGRESS_TRAINING: u8 = 50;
/// Highest progress trainer output may push a task to.
pub const PROGRESS_TRAINING_CEILING: u8 = 95;
pub const PROGRESS_DONE: u8 = 100;

/// Everything the driver needs to run one task.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub task_id: String,
    pub owner: String,
    pub asset: IngestedAsset,
}

#[derive(Clone)]
pub struct PipelineDriver {
    registry: TaskRegistry,
    reconstruction: Arc<dyn ReconstructionEngine>,
    training: Arc<dyn TrainingEngine>,
    iterations: u32,
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl PipelineDriver {
    pub fn new(
        registry: TaskRegistry,
        reconstruction: Arc<dyn ReconstructionEngine>,
        training: Arc<dyn TrainingEngine>,
        iterations: u32,
    ) -> Self {
        Self {
            registry,
            reconstruction,
            training,
            iterations,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Run reconstruction then training for `job`, recording every
    /// checkpoint. Returns the terminal status reached.
    pub async fn run(&self, job: PipelineJob) -> TaskStatus {
        let id = job.task_id.as_str();
        info!(task = %id, asset = %job.asset.asset_path.display(), "pipeline started");

        self.registry.update(
            id,
            TaskStatus::Processing,
            "reconstructing camera poses",
            PROGRESS_PROCESSING,
            None,
        );

        let recon_request = ReconstructionRequest {
            video_path: job.asset.asset_path.clone(),
            job_dir: job.asset.job_dir.clone(),
        };
        let recon = match self.reconstruction.reconstruct(&recon_request).await {
            Ok(out) => out,
            Err(e) => return self.fail(id, "reconstruction failed", &e),
        };

        match count_entries(&recon.model_dir).await {
            Ok(n) if n > 0 => {}
            Ok(_) => {
                warn!(task = %id, model_dir = %recon.model_dir.display(), "empty reconstruction output");
                self.registry.fail(
                    id,
                    "reconstruction failed: reconstruction produced no output",
                    Vec::new(),
                );
                return TaskStatus::Failed;
            }
            Err(e) => return self.fail(id, "reconstruction failed", &e),
        }

        self.registry.update(
            id,
            TaskStatus::Training,
            "training model",
            PROGRESS_TRAINING,
            None,
        );

        let train_request = TrainingRequest {
            source_dir: recon.workspace.clone(),
            output_dir: job.asset.job_dir.join("output"),
            iterations: self.iterations,
        };
        let progress = StageProgress::new(
            self.registry.clone(),
            id,
            TaskStatus::Training,
            "training model",
            PROGRESS_TRAINING,
            PROGRESS_TRAINING_CEILING,
        );
        let trained = match self.training.train(&train_request, progress).await {
            Ok(out) => out,
            Err(e) => return self.fail(id, "training failed", &e),
        };

        self.registry.update(
            id,
            TaskStatus::Completed,
            "processing complete",
            PROGRESS_DONE,
            Some(TaskResult {
                artifact_path: trained.artifact_path.clone(),
                owner: job.owner.clone(),
                filename: job.asset.name.clone(),
            }),
        );
        info!(task = %id, artifact = %trained.artifact_path.display(), "pipeline completed");
        TaskStatus::Completed
    }

    fn fail(&self, id: &str, context: &str, err: &SplatError) -> TaskStatus {
        error!(task = %id, error = %err, "{context}");
        let diagnostics = err.diagnostics();
        let skip = diagnostics.len().saturating_sub(DIAGNOSTIC_LINES);
        self.registry
            .fail(id, format!("{context}: {err}"), diagnostics[skip..].to_vec());
        TaskStatus::Failed
    }
}
