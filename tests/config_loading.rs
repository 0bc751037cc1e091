// tests/config_loading.rs

mod common;
use crate::common::{init_tracing, ConfigFileBuilder};

use std::error::Error;
use std::fs;
use std::time::Duration;

use splatpipe::config::{load_and_validate, load_or_default, parse_duration};
use splatpipe::errors::SplatError;
use splatpipe::types::ViewerMode;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn empty_file_yields_original_defaults() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Splatpipe.toml");
    fs::write(&path, "")?;

    let cfg = load_and_validate(&path)?;

    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.viewer.port, 8091);
    assert_eq!(cfg.viewer.mode, ViewerMode::Attached);
    assert_eq!(cfg.viewer.startup_timeout, Duration::from_secs(30));
    assert_eq!(cfg.upload.allowed_extensions, vec!["mp4", "avi", "mov", "mkv"]);
    assert_eq!(cfg.upload.max_size_bytes, 500 * 1024 * 1024);
    assert_eq!(cfg.reconstruction.frame_interval, 10);
    assert_eq!(cfg.training.iterations, 30_000);
    assert_eq!(cfg.training.extra_args, vec!["--eval"]);
    assert!(cfg.training.timeout.is_none());

    let step_names: Vec<&str> = cfg.reconstruction.steps.iter().map(|s| s.label()).collect();
    assert_eq!(step_names, vec!["feature_extractor", "exhaustive_matcher", "mapper"]);
    assert!(cfg
        .reconstruction
        .steps[0]
        .args
        .iter()
        .any(|a| a == "PINHOLE"));

    assert_eq!(cfg.viewer_log_file(), cfg.storage.log_dir.join("viewer.log"));
    Ok(())
}

#[test]
fn full_file_is_parsed() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Splatpipe.toml");
    fs::write(
        &path,
        r#"
[server]
host = "127.0.0.1"
public_host = "splat.example.org"

[pipeline]
max_concurrent_jobs = 1
max_queued_jobs = 3

[reconstruction]
frame_interval = 5
timeout = "2h"

[[reconstruction.steps]]
name = "mapper"
program = "colmap"
args = ["mapper", "--output_path", "{sparse}"]

[training]
conda_prefix = "/opt/conda/envs/gs"
script = "/srv/gs/train.py"
iterations = 7000
progress_pattern = "Training progress:\\s+(\\d+)%"
timeout = "90m"

[training.env]
CUDA_HOME = "${CONDA_PREFIX}"
PATH = "$CUDA_HOME/bin:$PATH"

[viewer]
script = "/srv/web-3dgs/main.py"
port = 9000
mode = "detached"
log_file = "/tmp/viewer.log"
stop_grace = "250ms"
"#,
    )?;

    let cfg = load_and_validate(&path)?;

    assert_eq!(cfg.viewer_host(), "127.0.0.1");
    assert_eq!(cfg.public_host(), "splat.example.org");
    assert_eq!(cfg.pipeline.max_concurrent_jobs, 1);
    assert_eq!(cfg.reconstruction.steps.len(), 1);
    assert_eq!(cfg.reconstruction.timeout, Some(Duration::from_secs(7200)));
    assert_eq!(cfg.training.iterations, 7000);
    assert_eq!(cfg.training.timeout, Some(Duration::from_secs(90 * 60)));
    assert_eq!(
        cfg.training.launcher.env.get("CUDA_HOME").map(String::as_str),
        Some("${CONDA_PREFIX}")
    );
    assert_eq!(cfg.viewer.port, 9000);
    assert_eq!(cfg.viewer.mode, ViewerMode::Detached);
    assert_eq!(cfg.viewer.stop_grace, Duration::from_millis(250));
    assert_eq!(cfg.viewer_log_file().to_str(), Some("/tmp/viewer.log"));
    Ok(())
}

#[test]
fn missing_file_falls_back_to_defaults() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let cfg = load_or_default(dir.path().join("nope.toml"))?;
    assert_eq!(cfg.viewer.port, 8091);
    Ok(())
}

#[test]
fn invalid_duration_is_a_toml_error() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Splatpipe.toml");
    fs::write(&path, "[viewer]\nstartup_timeout = \"soon\"\n")?;

    let err = load_and_validate(&path).unwrap_err();
    assert!(matches!(err, SplatError::TomlError(_)), "got {err:?}");
    Ok(())
}

fn config_error(builder: ConfigFileBuilder) -> String {
    match builder.try_build() {
        Err(SplatError::ConfigError(msg)) => msg,
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn validation_rejects_bad_values() {
    init_tracing();

    assert!(config_error(ConfigFileBuilder::new().max_concurrent_jobs(0))
        .contains("max_concurrent_jobs"));
    assert!(config_error(ConfigFileBuilder::new().allowed_extensions(&[]))
        .contains("allowed_extensions"));
    assert!(config_error(ConfigFileBuilder::new().allowed_extensions(&[".mp4"]))
        .contains(".mp4"));
    assert!(config_error(ConfigFileBuilder::new().iterations(0)).contains("iterations"));
    assert!(config_error(ConfigFileBuilder::new().viewer_port(0)).contains("port"));
    assert!(config_error(ConfigFileBuilder::new().reconstruction_steps(Vec::new()))
        .contains("steps"));
    assert!(config_error(ConfigFileBuilder::new().startup_timeout(Duration::ZERO))
        .contains("startup_timeout"));
}

#[test]
fn progress_pattern_must_compile_and_capture() {
    init_tracing();

    let msg = config_error(ConfigFileBuilder::new().progress_pattern("(unclosed"));
    assert!(msg.contains("not a valid regex"), "{msg}");

    let msg = config_error(ConfigFileBuilder::new().progress_pattern(r"\d+%"));
    assert!(msg.contains("capture group"), "{msg}");

    assert!(ConfigFileBuilder::new()
        .progress_pattern(r"(\d+)%")
        .try_build()
        .is_ok());
}

#[test]
fn duration_strings() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration(" 30s "), Ok(Duration::from_secs(30)));
    assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
    assert_eq!(parse_duration("7d"), Ok(Duration::from_secs(7 * 24 * 3600)));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("3w").is_err());
}

#[test]
fn shipped_sample_config_is_valid() -> TestResult {
    init_tracing();
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join("splatpipe.toml");
    let cfg = load_and_validate(&path)?;
    assert_eq!(cfg.reconstruction.steps.len(), 3);
    assert!(cfg.training.progress_pattern.is_some());
    assert_eq!(cfg.public_host(), "splat.example.org");
    Ok(())
}
