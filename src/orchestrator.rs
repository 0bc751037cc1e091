// src/orchestrator.rs

//! Facade tying the registry, ingest, job pool, pipeline driver and viewer
//! together. This is the surface a front end (the CLI, or an HTTP layer)
//! talks to.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ConfigFile;
use crate::errors::{Result, SplatError};
use crate::pipeline::{
    validate_owner, AssetIngest, JobPool, PipelineDriver, PipelineJob, ProcessReconstruction,
    ProcessTraining, ReconstructionEngine, TrainingEngine,
};
use crate::ports::PortResolver;
use crate::registry::{Task, TaskRegistry, TaskStatus};
use crate::viewer::{SessionStart, SessionStatus, ViewerSessionManager, ViewerSettings};

pub const PROGRESS_COPYING: u8 = 10;
pub const PROGRESS_COPIED: u8 = 20;

/// An accepted submission. The pipeline continues in the background.
#[derive(Debug)]
pub struct Submission {
    pub task_id: String,
    /// `None` when the task already failed while storing the upload.
    pub handle: Option<JoinHandle<()>>,
}

impl Submission {
    /// Wait for the background pipeline to finish.
    pub async fn join(self) {
        if let Some(handle) = self.handle {
            if let Err(e) = handle.await {
                warn!(task = %self.task_id, error = %e, "pipeline task panicked");
            }
        }
    }
}

#[derive(Debug)]
pub struct Orchestrator {
    registry: TaskRegistry,
    ingest: AssetIngest,
    pool: JobPool,
    driver: Arc<PipelineDriver>,
    viewer: ViewerSessionManager,
}

impl Orchestrator {
    /// Production wiring: process-backed engines and the default port probe.
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        let reconstruction = Arc::new(ProcessReconstruction::new(cfg.reconstruction.clone()));
        let training = Arc::new(ProcessTraining::new(cfg.training.clone())?);
        Ok(Self::new(cfg, reconstruction, training))
    }

    pub fn new(
        cfg: &ConfigFile,
        reconstruction: Arc<dyn ReconstructionEngine>,
        training: Arc<dyn TrainingEngine>,
    ) -> Self {
        Self::with_port_resolver(cfg, reconstruction, training, PortResolver::default())
    }

    pub fn with_port_resolver(
        cfg: &ConfigFile,
        reconstruction: Arc<dyn ReconstructionEngine>,
        training: Arc<dyn TrainingEngine>,
        resolver: PortResolver,
    ) -> Self {
        let registry = TaskRegistry::new();
        let driver = PipelineDriver::new(
            registry.clone(),
            reconstruction,
            training,
            cfg.training.iterations,
        );
        Self {
            ingest: AssetIngest::from_config(cfg),
            pool: JobPool::from_config(cfg),
            driver: Arc::new(driver),
            viewer: ViewerSessionManager::new(ViewerSettings::from_config(cfg), resolver),
            registry,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn ingest(&self) -> &AssetIngest {
        &self.ingest
    }

    pub fn pool(&self) -> &JobPool {
        &self.pool
    }

    pub fn viewer(&self) -> &ViewerSessionManager {
        &self.viewer
    }

    /// Accept a video for `owner` and start its pipeline in the background.
    ///
    /// Validation failures and a full pool are returned as errors before any
    /// task exists. Everything after that is reported through the task.
    pub async fn submit(&self, owner: &str, source: &Path) -> Result<Submission> {
        validate_owner(owner)?;
        let candidate = self.ingest.validate(source).await?;
        let ticket = self.pool.try_admit()?;

        let id = self.registry.next_id(owner);
        self.registry
            .create(&id, TaskStatus::Uploading, "upload started", 0);
        info!(task = %id, owner, source = %source.display(), "task created");

        self.registry.update(
            &id,
            TaskStatus::Uploading,
            "copying video",
            PROGRESS_COPYING,
            None,
        );
        let asset = match self.ingest.ingest(owner, &candidate).await {
            Ok(asset) => asset,
            Err(e) => {
                warn!(task = %id, error = %e, "storing upload failed");
                self.registry.update(
                    &id,
                    TaskStatus::Failed,
                    format!("saving upload failed: {e}"),
                    0,
                    None,
                );
                return Ok(Submission {
                    task_id: id,
                    handle: None,
                });
            }
        };

        self.registry.update(
            &id,
            TaskStatus::Uploading,
            "video stored",
            PROGRESS_COPIED,
            None,
        );
        self.registry.update(
            &id,
            TaskStatus::Uploaded,
            "queued for processing",
            PROGRESS_COPIED,
            None,
        );

        let driver = Arc::clone(&self.driver);
        let job = PipelineJob {
            task_id: id.clone(),
            owner: owner.to_string(),
            asset,
        };
        let handle = self.pool.spawn(ticket, id.clone(), async move {
            driver.run(job).await;
        });

        Ok(Submission {
            task_id: id,
            handle: Some(handle),
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.registry.require(id)
    }

    pub fn list_tasks(&self, owner: &str) -> Vec<Task> {
        self.registry.list_for(owner)
    }

    pub async fn start_session(&self, artifact: &Path) -> SessionStart {
        self.viewer.start(artifact).await
    }

    /// Start a viewer for the artifact of one of `owner`'s completed tasks.
    pub async fn start_session_for_task(&self, owner: &str, task_id: &str) -> Result<SessionStart> {
        let task = self.registry.require(task_id)?;
        if task.owner() != Some(owner) {
            return Err(SplatError::Validation(format!(
                "task {task_id} does not belong to {owner}"
            )));
        }
        let result = task.result.ok_or_else(|| {
            SplatError::Validation(format!("task {task_id} has no trained model yet"))
        })?;
        Ok(self.viewer.start(&result.artifact_path).await)
    }

    pub async fn stop_session(&self) -> Result<()> {
        self.viewer.stop().await
    }

    pub async fn session_status(&self) -> SessionStatus {
        self.viewer.status().await
    }

    /// Stop the viewer and free its port. In-flight pipelines are not
    /// interrupted.
    pub async fn shutdown(&self) -> Result<()> {
        info!(in_flight = self.pool.in_flight(), "shutting down");
        self.viewer.stop().await
    }
}
