// tests/launch_env.rs

mod common;
use crate::common::init_tracing;

use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};

use splatpipe::config::LauncherConfig;
use splatpipe::errors::SplatError;
use splatpipe::exec::launch::script_interpreter;
use splatpipe::exec::{activation_env, expand_env_with, render_args, resolve_env, LaunchSpec};

type TestResult = Result<(), Box<dyn Error>>;

fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn inherited(name: &str) -> Option<String> {
    match name {
        "PATH" => Some("/usr/bin:/bin".to_string()),
        "HOME" => Some("/home/splat".to_string()),
        _ => None,
    }
}

#[test]
fn self_reference_extends_inherited_value() {
    let out = expand_env_with(
        &vars(&[("CUDA_HOME", "/opt/cuda"), ("PATH", "$CUDA_HOME/bin:$PATH")]),
        inherited,
    );
    assert_eq!(out["PATH"], "/opt/cuda/bin:/usr/bin:/bin");
    assert_eq!(out["CUDA_HOME"], "/opt/cuda");
}

#[test]
fn braces_and_cross_references() {
    let out = expand_env_with(
        &vars(&[
            ("ROOT", "${HOME}/gs"),
            ("LIB", "${ROOT}/lib"),
            ("LD_LIBRARY_PATH", "$LIB:${LD_LIBRARY_PATH}"),
        ]),
        inherited,
    );
    assert_eq!(out["ROOT"], "/home/splat/gs");
    assert_eq!(out["LIB"], "/home/splat/gs/lib");
    // Unknown inherited variables expand to "".
    assert_eq!(out["LD_LIBRARY_PATH"], "/home/splat/gs/lib:");
}

#[test]
fn cycles_fall_back_to_inherited() {
    let out = expand_env_with(&vars(&[("A", "a:$B"), ("B", "b:$A")]), inherited);
    // Resolving A expands B with A in progress; B keeps that value.
    assert_eq!(out["A"], "a:b:");
    assert_eq!(out["B"], "b:");
}

#[test]
fn dollar_signs_that_are_not_references_stay_literal() {
    let out = expand_env_with(
        &vars(&[("PRICE", "$5 and ${not closed"), ("TRAIL", "end$")]),
        inherited,
    );
    assert_eq!(out["PRICE"], "$5 and ${not closed");
    assert_eq!(out["TRAIL"], "end$");
}

#[test]
fn activation_sets_conda_variables() {
    let env = activation_env(Some(Path::new("/opt/conda/envs/gaussian_splatting")));
    assert_eq!(env["CONDA_PREFIX"], "/opt/conda/envs/gaussian_splatting");
    assert_eq!(env["CONDA_DEFAULT_ENV"], "gaussian_splatting");
    assert!(env["PATH"].starts_with("/opt/conda/envs/gaussian_splatting/bin"));

    assert!(activation_env(None).is_empty());
}

#[test]
fn overrides_see_the_activation_layer() {
    let env = resolve_env(
        Some(Path::new("/opt/conda/envs/gs")),
        &vars(&[("CUDA_HOME", "${CONDA_PREFIX}")]),
    );
    assert_eq!(env["CUDA_HOME"], "/opt/conda/envs/gs");
    assert_eq!(env["CONDA_PREFIX"], "/opt/conda/envs/gs");
}

#[test]
fn render_args_substitutes_known_placeholders() {
    let template: Vec<String> = ["-i", "{video}", "{images}/frame_%06d.jpg", "{unknown}"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let out = render_args(
        &template,
        &[
            ("video", "/data/a b/input.mp4".to_string()),
            ("images", "/ws/images".to_string()),
        ],
    );
    assert_eq!(
        out,
        vec!["-i", "/data/a b/input.mp4", "/ws/images/frame_%06d.jpg", "{unknown}"]
    );
}

#[test]
fn launcher_with_program() -> TestResult {
    init_tracing();
    let launcher = LauncherConfig {
        program: Some("gs-train".to_string()),
        env: vars(&[("OMP_NUM_THREADS", "4")]),
        ..Default::default()
    };

    let spec = LaunchSpec::from_launcher("training", &launcher, vec!["-s".into(), "/src".into()])?;
    assert_eq!(spec.program, PathBuf::from("gs-train"));
    assert_eq!(spec.args, vec!["-s", "/src"]);
    assert_eq!(spec.env["OMP_NUM_THREADS"], "4");
    assert!(spec.working_dir.is_none());
    assert!(spec.required_files.is_empty());
    assert_eq!(spec.command_line(), "gs-train -s /src");
    Ok(())
}

#[test]
fn script_interpreter_prefers_explicit_then_conda() {
    let mut launcher = LauncherConfig {
        script: Some(PathBuf::from("/srv/gs/train.py")),
        ..Default::default()
    };
    assert_eq!(script_interpreter(&launcher), PathBuf::from("python3"));

    launcher.conda_prefix = Some(PathBuf::from("/opt/conda/envs/gs"));
    assert_eq!(
        script_interpreter(&launcher),
        PathBuf::from("/opt/conda/envs/gs/bin/python")
    );

    launcher.interpreter = Some("/usr/bin/python3.11".to_string());
    assert_eq!(script_interpreter(&launcher), PathBuf::from("/usr/bin/python3.11"));
}

#[test]
fn launcher_with_script_uses_conda_python() -> TestResult {
    init_tracing();
    let launcher = LauncherConfig {
        script: Some(PathBuf::from("/srv/gs/train.py")),
        conda_prefix: Some(PathBuf::from("/opt/conda/envs/gs")),
        ..Default::default()
    };

    let spec = LaunchSpec::from_launcher("training", &launcher, vec!["--eval".into()])?;
    assert_eq!(spec.program, PathBuf::from("/opt/conda/envs/gs/bin/python"));
    assert_eq!(spec.args, vec!["/srv/gs/train.py", "--eval"]);
    assert_eq!(spec.working_dir, Some(PathBuf::from("/srv/gs")));
    assert_eq!(spec.required_files, vec![PathBuf::from("/srv/gs/train.py")]);
    assert_eq!(spec.env["CONDA_PREFIX"], "/opt/conda/envs/gs");
    Ok(())
}

#[test]
fn explicit_interpreter_and_working_dir_win() -> TestResult {
    let launcher = LauncherConfig {
        script: Some(PathBuf::from("/srv/web/main.py")),
        interpreter: Some("python3.11".to_string()),
        conda_prefix: Some(PathBuf::from("/opt/conda/envs/gs")),
        working_dir: Some(PathBuf::from("/var/run/viewer")),
        ..Default::default()
    };

    let spec = LaunchSpec::from_launcher("viewer", &launcher, Vec::new())?;
    assert_eq!(spec.program, PathBuf::from("python3.11"));
    assert_eq!(spec.working_dir, Some(PathBuf::from("/var/run/viewer")));
    Ok(())
}

#[test]
fn launcher_without_program_or_script_is_a_launch_error() {
    let err = LaunchSpec::from_launcher("viewer", &LauncherConfig::default(), Vec::new())
        .unwrap_err();
    match err {
        SplatError::Launch { program, reason } => {
            assert_eq!(program, "viewer");
            assert!(reason.contains("no program or script"));
        }
        other => panic!("expected Launch, got {other:?}"),
    }
}
