// tests/pipeline_processes.rs

mod common;
use crate::common::{init_tracing, wait_for_task, with_timeout, write_script, write_video, ConfigFileBuilder};

use std::error::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use splatpipe::config::CommandTemplate;
use splatpipe::errors::SplatError;
use splatpipe::pipeline::{
    find_artifact, ProcessReconstruction, ProcessTraining, ReconstructionEngine,
    ReconstructionRequest, StageProgress, TrainingEngine, TrainingRequest,
};
use splatpipe::registry::{TaskRegistry, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

/// Fake trainer: understands `-m` and `--iterations`, prints progress and
/// writes the point cloud where the real trainer would.
const TRAINER: &str = r#"
out=""; it=""
while [ $# -gt 0 ]; do
  case "$1" in
    -m) out="$2"; shift ;;
    --iterations) it="$2"; shift ;;
  esac
  shift
done
for p in 10 40 100; do echo "Training progress: $p%"; done
mkdir -p "$out/point_cloud/iteration_$it"
echo ply > "$out/point_cloud/iteration_$it/point_cloud.ply"
"#;

fn sh_step(name: &str, script: &Path, args: &[&str]) -> CommandTemplate {
    let script = script.to_string_lossy().into_owned();
    let mut all = vec![script.as_str()];
    all.extend_from_slice(args);
    CommandTemplate::new(name, "sh", &all)
}

fn training_request(root: &Path, iterations: u32) -> TrainingRequest {
    TrainingRequest {
        source_dir: root.join("colmap"),
        output_dir: root.join("output"),
        iterations,
    }
}

#[tokio::test]
async fn reconstruction_runs_frames_then_steps() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let frames = write_script(dir.path(), "frames.sh", "test -f \"$1\" || exit 9\ntouch \"$2/frame_000000.jpg\"");
    let mapper = write_script(dir.path(), "mapper.sh", "mkdir -p \"$1/0\"\ntouch \"$1/0/cameras.bin\"");

    let cfg = ConfigFileBuilder::new()
        .frames_command(sh_step("extract_frames", &frames, &["{video}", "{images}"]))
        .reconstruction_steps(vec![sh_step("mapper", &mapper, &["{sparse}"])])
        .build();
    let engine = ProcessReconstruction::new(cfg.reconstruction.clone());

    let job_dir = dir.path().join("job");
    let request = ReconstructionRequest {
        video_path: write_video(dir.path(), "input.mp4"),
        job_dir: job_dir.clone(),
    };
    let out = with_timeout(engine.reconstruct(&request)).await?;

    assert_eq!(out.workspace, job_dir.join("colmap"));
    assert!(out.images_dir.join("frame_000000.jpg").is_file());
    assert!(out.model_dir.join("0").join("cameras.bin").is_file());
    Ok(())
}

#[tokio::test]
async fn reconstruction_without_frames_fails() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let mapper = write_script(dir.path(), "mapper.sh", "exit 0");
    let cfg = ConfigFileBuilder::new()
        .extract_frames(false)
        .reconstruction_steps(vec![sh_step("mapper", &mapper, &[])])
        .build();
    let engine = ProcessReconstruction::new(cfg.reconstruction.clone());

    let request = ReconstructionRequest {
        video_path: write_video(dir.path(), "input.mp4"),
        job_dir: dir.path().join("job"),
    };
    let err = with_timeout(engine.reconstruct(&request)).await.unwrap_err();
    assert!(err.to_string().contains("no frames"), "{err}");
    Ok(())
}

#[tokio::test]
async fn failing_step_reports_its_label_and_output() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let frames = write_script(dir.path(), "frames.sh", "touch \"$1/frame_000000.jpg\"");
    let matcher = write_script(dir.path(), "matcher.sh", "echo 'out of memory' >&2\nexit 2");
    let mapper = write_script(dir.path(), "mapper.sh", "touch \"$1/never\"");

    let cfg = ConfigFileBuilder::new()
        .frames_command(sh_step("extract_frames", &frames, &["{images}"]))
        .reconstruction_steps(vec![
            sh_step("exhaustive_matcher", &matcher, &[]),
            sh_step("mapper", &mapper, &["{sparse}"]),
        ])
        .build();
    let engine = ProcessReconstruction::new(cfg.reconstruction.clone());

    let job_dir = dir.path().join("job");
    let request = ReconstructionRequest {
        video_path: write_video(dir.path(), "input.mp4"),
        job_dir: job_dir.clone(),
    };
    match with_timeout(engine.reconstruct(&request)).await {
        Err(SplatError::ProcessFailed { label, code, tail }) => {
            assert_eq!(label, "exhaustive_matcher");
            assert_eq!(code, 2);
            assert_eq!(tail, vec!["out of memory"]);
        }
        other => panic!("expected ProcessFailed, got {other:?}"),
    }
    assert!(!job_dir.join("colmap").join("sparse").join("never").exists());
    Ok(())
}

#[tokio::test]
async fn reconstruction_timeout_stops_the_step() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let slow = write_script(dir.path(), "slow.sh", "exec sleep 30");
    let cfg = ConfigFileBuilder::new()
        .extract_frames(false)
        .reconstruction_steps(vec![sh_step("mapper", &slow, &[])])
        .reconstruction_timeout(Duration::from_millis(300))
        .build();
    let engine = ProcessReconstruction::new(cfg.reconstruction.clone());

    let job_dir = dir.path().join("job");
    fs::create_dir_all(job_dir.join("colmap").join("images"))?;
    fs::write(job_dir.join("colmap").join("images").join("f.jpg"), b"")?;
    let request = ReconstructionRequest {
        video_path: write_video(dir.path(), "input.mp4"),
        job_dir,
    };
    match with_timeout(engine.reconstruct(&request)).await {
        Err(SplatError::StageTimeout { stage, timeout }) => {
            assert_eq!(stage, "reconstruction");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected StageTimeout, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn training_reports_progress_and_finds_artifact() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let trainer = write_script(dir.path(), "train.sh", TRAINER);
    let cfg = ConfigFileBuilder::new()
        .training_script(&trainer, "sh")
        .progress_pattern(r"Training progress:\s+(\d+)%")
        .build();
    let engine = ProcessTraining::new(cfg.training.clone())?;

    let registry = TaskRegistry::new();
    registry.create("t_1", TaskStatus::Training, "training model", 50);
    let progress = StageProgress::new(registry.clone(), "t_1", TaskStatus::Training, "training model", 50, 95);

    let request = training_request(dir.path(), 1234);
    let args = engine.command_args(&request);
    assert_eq!(&args[..2], &["-s".to_string(), request.source_dir.to_string_lossy().into_owned()]);
    assert_eq!(args.last().map(String::as_str), Some("--eval"));

    let out = with_timeout(engine.train(&request, progress)).await?;
    assert_eq!(
        out.artifact_path,
        request
            .output_dir
            .join("point_cloud")
            .join("iteration_1234")
            .join("point_cloud.ply")
    );
    assert_eq!(out.log_tail.last().map(String::as_str), Some("Training progress: 100%"));

    let task = wait_for_task(&registry, "t_1", |t| t.progress == 95).await;
    assert_eq!(task.message, "training model (100%)");
    Ok(())
}

#[tokio::test]
async fn training_exit_code_becomes_process_failed() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let trainer = write_script(
        dir.path(),
        "train.sh",
        "i=1\nwhile [ $i -le 15 ]; do echo \"iter $i\"; i=$((i+1)); done\necho 'CUDA error'\nexit 1",
    );
    let cfg = ConfigFileBuilder::new().training_script(&trainer, "sh").build();
    let engine = ProcessTraining::new(cfg.training.clone())?;

    let request = training_request(dir.path(), 10);
    match with_timeout(engine.train(&request, StageProgress::noop())).await {
        Err(err @ SplatError::ProcessFailed { .. }) => {
            assert_eq!(err.to_string(), "training exited with code 1");
            let tail = err.diagnostics();
            assert_eq!(tail.len(), 10);
            assert!(tail.contains(&"CUDA error".to_string()));
            assert!(!tail.contains(&"iter 1".to_string()));
        }
        other => panic!("expected ProcessFailed, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn training_timeout() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let trainer = write_script(dir.path(), "train.sh", "echo started\nexec sleep 30");
    let cfg = ConfigFileBuilder::new()
        .training_script(&trainer, "sh")
        .training_timeout(Duration::from_millis(300))
        .build();
    let engine = ProcessTraining::new(cfg.training.clone())?;

    let request = training_request(dir.path(), 10);
    match with_timeout(engine.train(&request, StageProgress::noop())).await {
        Err(SplatError::StageTimeout { stage, .. }) => assert_eq!(stage, "training"),
        other => panic!("expected StageTimeout, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn training_launch_problems() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let request = training_request(dir.path(), 10);

    let cfg = ConfigFileBuilder::new()
        .training_script(dir.path().join("missing.py"), "sh")
        .build();
    let engine = ProcessTraining::new(cfg.training.clone())?;
    match with_timeout(engine.train(&request, StageProgress::noop())).await {
        Err(SplatError::Launch { program, reason }) => {
            assert_eq!(program, "training");
            assert!(reason.contains("missing.py"), "{reason}");
        }
        other => panic!("expected Launch, got {other:?}"),
    }

    let engine = ProcessTraining::new(ConfigFileBuilder::new().build().training)?;
    assert!(matches!(
        with_timeout(engine.train(&request, StageProgress::noop())).await,
        Err(SplatError::Launch { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn successful_trainer_without_artifact_is_an_error() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let trainer = write_script(dir.path(), "train.sh", "echo done");
    let cfg = ConfigFileBuilder::new().training_script(&trainer, "sh").build();
    let engine = ProcessTraining::new(cfg.training.clone())?;

    let request = training_request(dir.path(), 10);
    match with_timeout(engine.train(&request, StageProgress::noop())).await {
        Err(SplatError::ArtifactMissing(path)) => assert_eq!(path, request.output_dir),
        other => panic!("expected ArtifactMissing, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn artifact_lookup_falls_back_to_any_ply() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output");

    assert!(matches!(
        find_artifact(&output, 30_000).await,
        Err(SplatError::ArtifactMissing(_))
    ));

    let other = output.join("point_cloud").join("iteration_7000");
    fs::create_dir_all(&other)?;
    fs::write(other.join("point_cloud.ply"), b"ply")?;
    fs::write(output.join("cameras.json"), b"{}")?;
    assert_eq!(
        find_artifact(&output, 30_000).await?,
        other.join("point_cloud.ply")
    );

    let expected = output.join("point_cloud").join("iteration_30000");
    fs::create_dir_all(&expected)?;
    fs::write(expected.join("point_cloud.ply"), b"ply")?;
    assert_eq!(
        find_artifact(&output, 30_000).await?,
        expected.join("point_cloud.ply")
    );
    Ok(())
}
