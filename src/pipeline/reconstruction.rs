// src/pipeline/reconstruction.rs

//! Process-backed reconstruction: frame extraction followed by the
//! configured reconstruction commands (COLMAP by default).
//!
//! Workspace layout under the job directory:
//!
//! ```text
//! colmap/
//!   images/       extracted frames
//!   database.db   feature database
//!   sparse/       sparse model(s)
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use tokio::fs;
use tracing::info;

use crate::config::{CommandTemplate, ReconstructionSection};
use crate::errors::{Result, SplatError};
use crate::exec::{render_args, resolve_env, LaunchSpec, ManagedProcess, StartOptions};
use crate::pipeline::stage::{run_to_completion, StageLimit};
use crate::pipeline::{
    ReconstructionEngine, ReconstructionOutput, ReconstructionRequest, StageFuture,
};
use crate::types::Stage;

#[derive(Debug, Clone)]
pub struct ProcessReconstruction {
    settings: ReconstructionSection,
}

impl ProcessReconstruction {
    pub fn new(settings: ReconstructionSection) -> Self {
        Self { settings }
    }

    async fn run(&self, request: &ReconstructionRequest) -> Result<ReconstructionOutput> {
        let workspace = request.job_dir.join("colmap");
        let images_dir = workspace.join("images");
        let model_dir = workspace.join("sparse");
        let database = workspace.join("database.db");

        fs::create_dir_all(&images_dir).await?;
        fs::create_dir_all(&model_dir).await?;

        let vars = [
            ("video", display(&request.video_path)),
            ("workspace", display(&workspace)),
            ("images", display(&images_dir)),
            ("sparse", display(&model_dir)),
            ("database", display(&database)),
            ("frame_interval", self.settings.frame_interval.to_string()),
        ];
        let env = resolve_env(self.settings.conda_prefix.as_deref(), &self.settings.env);
        let limit = StageLimit::starting_now(Stage::Reconstruction, self.settings.timeout);

        if self.settings.extract_frames {
            self.run_command(&self.settings.frames, &vars, &env, limit)
                .await?;
        }

        let frames = count_entries(&images_dir).await?;
        if frames == 0 {
            return Err(SplatError::Other(anyhow::anyhow!(
                "no frames found in {}",
                images_dir.display()
            )));
        }
        info!(frames, images = %images_dir.display(), "frames ready for reconstruction");

        for step in &self.settings.steps {
            self.run_command(step, &vars, &env, limit).await?;
        }

        Ok(ReconstructionOutput {
            workspace,
            images_dir,
            model_dir,
        })
    }

    async fn run_command(
        &self,
        template: &CommandTemplate,
        vars: &[(&str, String)],
        env: &BTreeMap<String, String>,
        limit: Option<StageLimit>,
    ) -> Result<()> {
        let mut spec = LaunchSpec::new(template.label(), &template.program)
            .args(render_args(&template.args, vars))
            .envs(env.clone());
        if let Some(dir) = &self.settings.working_dir {
            spec = spec.current_dir(dir);
        }

        let mut process = ManagedProcess::start(&spec, StartOptions::piped())?;
        run_to_completion(&mut process, limit).await?;
        Ok(())
    }
}

impl ReconstructionEngine for ProcessReconstruction {
    fn reconstruct<'a>(
        &'a self,
        request: &'a ReconstructionRequest,
    ) -> StageFuture<'a, ReconstructionOutput> {
        Box::pin(self.run(request))
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Number of entries in `dir`; a missing directory counts as empty.
pub(crate) async fn count_entries(dir: &Path) -> Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    while entries.next_entry().await?.is_some() {
        count += 1;
    }
    Ok(count)
}
