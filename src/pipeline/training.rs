// src/pipeline/training.rs

//! Process-backed Gaussian-splat training.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use tokio::fs;
use tracing::{debug, info};

use crate::config::TrainingSection;
use crate::errors::{Result, SplatError};
use crate::exec::{LaunchSpec, ManagedProcess, StartOptions, DIAGNOSTIC_LINES};
use crate::pipeline::stage::{run_to_completion, StageLimit};
use crate::pipeline::{StageFuture, StageProgress, TrainingEngine, TrainingOutput, TrainingRequest};
use crate::types::Stage;

/// Runs `<interpreter> <script> -s <source> -m <output> --iterations <n>
/// [extra_args...]`.
#[derive(Debug, Clone)]
pub struct ProcessTraining {
    settings: TrainingSection,
    progress_pattern: Option<Regex>,
}

impl ProcessTraining {
    pub fn new(settings: TrainingSection) -> Result<Self> {
        let progress_pattern = settings
            .progress_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                SplatError::ConfigError(format!("[training].progress_pattern: {e}"))
            })?;
        Ok(Self {
            settings,
            progress_pattern,
        })
    }

    pub fn command_args(&self, request: &TrainingRequest) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            request.source_dir.to_string_lossy().into_owned(),
            "-m".to_string(),
            request.output_dir.to_string_lossy().into_owned(),
            "--iterations".to_string(),
            request.iterations.to_string(),
        ];
        args.extend(self.settings.extra_args.iter().cloned());
        args
    }

    async fn run(&self, request: &TrainingRequest, progress: StageProgress) -> Result<TrainingOutput> {
        fs::create_dir_all(&request.output_dir).await?;

        let spec = LaunchSpec::from_launcher(
            Stage::Training.as_str(),
            &self.settings.launcher,
            self.command_args(request),
        )?;
        let limit = StageLimit::starting_now(Stage::Training, self.settings.timeout);

        let mut process = ManagedProcess::start(&spec, StartOptions::piped())?;
        if let Some(re) = self.progress_pattern.clone() {
            process.spawn_monitor(Some(Box::new(move |line: &str| {
                if let Some(percent) = parse_percent(&re, line) {
                    progress.report(percent);
                }
            })));
        }

        run_to_completion(&mut process, limit).await?;
        let log_tail = process.tail(DIAGNOSTIC_LINES);

        let artifact_path = find_artifact(&request.output_dir, request.iterations).await?;
        info!(artifact = %artifact_path.display(), "training produced artifact");

        Ok(TrainingOutput {
            artifact_path,
            output_dir: request.output_dir.clone(),
            log_tail,
        })
    }
}

impl TrainingEngine for ProcessTraining {
    fn train<'a>(
        &'a self,
        request: &'a TrainingRequest,
        progress: StageProgress,
    ) -> StageFuture<'a, TrainingOutput> {
        Box::pin(self.run(request, progress))
    }
}

fn parse_percent(re: &Regex, line: &str) -> Option<u8> {
    let caps = re.captures(line)?;
    let value: f64 = caps.get(1)?.as_str().trim().parse().ok()?;
    Some(value.clamp(0.0, 100.0) as u8)
}

/// Locate the trained point cloud under `output_dir`.
///
/// Prefers `point_cloud/iteration_<iterations>/point_cloud.ply`, otherwise
/// the most recently modified `*.ply` anywhere below `output_dir`.
pub async fn find_artifact(output_dir: &Path, iterations: u32) -> Result<PathBuf> {
    let expected = output_dir
        .join("point_cloud")
        .join(format!("iteration_{iterations}"))
        .join("point_cloud.ply");
    if fs::try_exists(&expected).await? {
        return Ok(expected);
    }
    debug!(expected = %expected.display(), "expected artifact missing; searching for newest .ply");

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    let mut pending = vec![output_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            let is_ply = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("ply"));
            if !is_ply {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let newer = newest
                .as_ref()
                .is_none_or(|(best, best_path)| (modified, &path) > (*best, best_path));
            if newer {
                newest = Some((modified, path));
            }
        }
    }

    newest
        .map(|(_, path)| path)
        .ok_or_else(|| SplatError::ArtifactMissing(output_dir.to_path_buf()))
}
