// crates/test-utils/src/fakes.rs

//! Stage engines that never spawn a process.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use splatpipe::errors::SplatError;
use splatpipe::pipeline::{
    ReconstructionEngine, ReconstructionOutput, ReconstructionRequest, StageFuture,
    StageProgress, TrainingEngine, TrainingOutput, TrainingRequest,
};

#[derive(Debug, Clone)]
pub enum ReconBehaviour {
    /// Write one model file into `colmap/sparse/0/`.
    Succeed,
    /// Report success but leave the model directory empty.
    Empty,
    Fail(String),
}

/// Reconstruction engine that records requests and fakes the workspace.
#[derive(Debug, Clone)]
pub struct FakeReconstruction {
    behaviour: ReconBehaviour,
    pub calls: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeReconstruction {
    pub fn new(behaviour: ReconBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(ReconBehaviour::Succeed)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ReconstructionEngine for FakeReconstruction {
    fn reconstruct<'a>(
        &'a self,
        request: &'a ReconstructionRequest,
    ) -> StageFuture<'a, ReconstructionOutput> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(request.video_path.clone());

            let workspace = request.job_dir.join("colmap");
            let images_dir = workspace.join("images");
            let model_dir = workspace.join("sparse");
            tokio::fs::create_dir_all(&images_dir).await?;
            tokio::fs::create_dir_all(&model_dir).await?;

            match &self.behaviour {
                ReconBehaviour::Succeed => {
                    let model = model_dir.join("0");
                    tokio::fs::create_dir_all(&model).await?;
                    tokio::fs::write(model.join("cameras.bin"), b"fake").await?;
                }
                ReconBehaviour::Empty => {}
                ReconBehaviour::Fail(msg) => {
                    return Err(SplatError::Other(anyhow::anyhow!("{msg}")));
                }
            }

            Ok(ReconstructionOutput {
                workspace,
                images_dir,
                model_dir,
            })
        })
    }
}

#[derive(Debug, Clone)]
pub enum TrainBehaviour {
    /// Report each percentage, then write the artifact.
    Succeed { progress: Vec<u8> },
    /// Fail as if the trainer exited with `code` after printing `lines`.
    Fail { code: i32, lines: Vec<String> },
}

/// Training engine that records requests and writes a fake `.ply`.
///
/// With a gate, every run waits for one permit before finishing, so tests
/// can hold jobs in flight.
#[derive(Debug, Clone)]
pub struct FakeTraining {
    behaviour: TrainBehaviour,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
    pub calls: Arc<Mutex<Vec<TrainingRequest>>>,
}

impl FakeTraining {
    pub fn new(behaviour: TrainBehaviour) -> Self {
        Self {
            behaviour,
            gate: None,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(TrainBehaviour::Succeed {
            progress: Vec::new(),
        })
    }

    pub fn failing(code: i32, lines: usize) -> Self {
        Self::new(TrainBehaviour::Fail {
            code,
            lines: (1..=lines).map(|i| format!("trainer line {i}")).collect(),
        })
    }

    /// Hold every run until a permit is added to the returned semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl TrainingEngine for FakeTraining {
    fn train<'a>(
        &'a self,
        request: &'a TrainingRequest,
        progress: StageProgress,
    ) -> StageFuture<'a, TrainingOutput> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(request.clone());

            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|e| SplatError::Other(anyhow::anyhow!(e)))?
                    .forget();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            match &self.behaviour {
                TrainBehaviour::Succeed { progress: steps } => {
                    for percent in steps {
                        progress.report(*percent);
                    }
                    let dir = request
                        .output_dir
                        .join("point_cloud")
                        .join(format!("iteration_{}", request.iterations));
                    tokio::fs::create_dir_all(&dir).await?;
                    let artifact_path = dir.join("point_cloud.ply");
                    tokio::fs::write(&artifact_path, b"ply\n").await?;
                    Ok(TrainingOutput {
                        artifact_path,
                        output_dir: request.output_dir.clone(),
                        log_tail: Vec::new(),
                    })
                }
                TrainBehaviour::Fail { code, lines } => Err(SplatError::ProcessFailed {
                    label: "training".to_string(),
                    code: *code,
                    tail: lines.clone(),
                }),
            }
        })
    }
}
