// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod ports;
pub mod registry;
pub mod types;
pub mod viewer;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command};
use crate::config::loader::{default_config_path, load_or_default};
use crate::config::ConfigFile;
use crate::orchestrator::Orchestrator;
use crate::pipeline::AssetIngest;
use crate::ports::PortResolver;
use crate::registry::{Task, TaskStatus};
use crate::viewer::{SessionStart, ViewerSessionManager, ViewerSettings};

pub use crate::orchestrator::Submission;

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let cfg = load_or_default(&config_path)?;

    match args.command {
        Command::Check => {
            print_check(&config_path, &cfg);
            Ok(())
        }
        Command::Run {
            owner,
            json,
            videos,
        } => run_pipelines(&cfg, &owner, json, &videos).await,
        Command::View { artifact } => view(&cfg, &artifact).await,
        Command::FreePort { port, grace } => free_port(port, grace).await,
        Command::Prune { owner, older_than } => {
            let removed = AssetIngest::from_config(&cfg)
                .prune(&owner, older_than)
                .await?;
            for dir in &removed {
                println!("removed {}", dir.display());
            }
            println!("{} job directories removed", removed.len());
            Ok(())
        }
    }
}

/// Submit every video, follow progress on stderr, and report the final
/// records. Fails if any submission was rejected or any task failed.
async fn run_pipelines(cfg: &ConfigFile, owner: &str, json: bool, videos: &[PathBuf]) -> Result<()> {
    let orchestrator = Orchestrator::from_config(cfg)?;
    let mut events = orchestrator.registry().subscribe();

    let mut submissions = Vec::new();
    let mut rejected = 0usize;
    for video in videos {
        match orchestrator.submit(owner, video).await {
            Ok(submission) => {
                info!(task = %submission.task_id, video = %video.display(), "submitted");
                submissions.push(submission);
            }
            Err(e) => {
                eprintln!("{}: rejected: {e}", video.display());
                rejected += 1;
            }
        }
    }

    let ids: Vec<String> = submissions.iter().map(|s| s.task_id.clone()).collect();
    let watched: HashSet<String> = ids.iter().cloned().collect();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(task) if watched.contains(&task.id) => {
                    if !json {
                        eprintln!(
                            "[{}] {:>3}% {:<10} {}",
                            task.id, task.progress, task.status, task.message
                        );
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for submission in submissions {
        submission.join().await;
    }
    printer.abort();

    let tasks: Vec<Task> = ids
        .iter()
        .filter_map(|id| orchestrator.get_task(id).ok())
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        print_summary(&tasks);
    }

    let failed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .count()
        + rejected;
    if failed > 0 {
        bail!("{failed} of {} submissions failed", videos.len());
    }
    Ok(())
}

async fn view(cfg: &ConfigFile, artifact: &Path) -> Result<()> {
    let viewer = ViewerSessionManager::new(ViewerSettings::from_config(cfg), PortResolver::default());

    match viewer.start(artifact).await {
        SessionStart::Started { url, pid } => {
            println!("viewer running at {url} (pid {pid}); press Ctrl-C to stop");
        }
        SessionStart::Simulated { url, reason } => {
            println!("viewer not available ({reason}); placeholder URL: {url}");
            return Ok(());
        }
        SessionStart::Failed {
            reason,
            fallback_url,
        } => {
            bail!("viewer failed to start: {reason} (fallback: {fallback_url})");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received; stopping viewer");
    viewer.stop().await?;
    Ok(())
}

async fn free_port(port: u16, grace: Duration) -> Result<()> {
    let report = PortResolver::default().free(port, grace).await?;
    if report.is_noop() {
        println!("port {port} is free");
    } else {
        println!(
            "port {port}: terminated {:?}, killed {:?}",
            report.terminated, report.killed
        );
    }
    report.into_result(port)?;
    Ok(())
}

fn print_summary(tasks: &[Task]) {
    for task in tasks {
        match (&task.status, &task.result) {
            (TaskStatus::Completed, Some(result)) => {
                println!("{}  completed  {}", task.id, result.artifact_path.display());
            }
            _ => {
                println!("{}  {}  {}", task.id, task.status, task.message);
                for line in &task.diagnostics {
                    println!("    | {line}");
                }
            }
        }
    }
}

/// Simple dry-run output: print the resolved configuration.
fn print_check(path: &Path, cfg: &ConfigFile) {
    println!("splatpipe check ({})", path.display());
    println!("  storage.data_dir = {}", cfg.storage.data_dir.display());
    println!("  storage.log_dir = {}", cfg.storage.log_dir.display());
    println!(
        "  upload: {} (max {} bytes)",
        cfg.upload.allowed_extensions.join(", "),
        cfg.upload.max_size_bytes
    );
    println!(
        "  pipeline: {} concurrent, {} queued",
        cfg.pipeline.max_concurrent_jobs, cfg.pipeline.max_queued_jobs
    );
    println!();

    let rc = &cfg.reconstruction;
    println!("reconstruction (every {}th frame):", rc.frame_interval);
    if rc.extract_frames {
        println!("  - {}: {} {}", rc.frames.label(), rc.frames.program, rc.frames.args.join(" "));
    }
    for step in &rc.steps {
        println!("  - {}: {} {}", step.label(), step.program, step.args.join(" "));
    }
    if let Some(timeout) = rc.timeout {
        println!("  timeout: {timeout:?}");
    }

    let tr = &cfg.training;
    println!("training:");
    print_launcher(&tr.launcher);
    println!("  iterations: {}", tr.iterations);
    if !tr.extra_args.is_empty() {
        println!("  extra_args: {}", tr.extra_args.join(" "));
    }
    if let Some(pattern) = &tr.progress_pattern {
        println!("  progress_pattern: {pattern}");
    }
    if let Some(timeout) = tr.timeout {
        println!("  timeout: {timeout:?}");
    }

    let vw = &cfg.viewer;
    println!("viewer:");
    print_launcher(&vw.launcher);
    println!("  listen: {}:{} ({})", cfg.viewer_host(), vw.port, vw.mode);
    if vw.mode == types::ViewerMode::Detached {
        println!("  log_file: {}", cfg.viewer_log_file().display());
    }
    println!(
        "  startup_timeout: {:?}, stop_grace: {:?}",
        vw.startup_timeout, vw.stop_grace
    );

    debug!("check complete (no execution)");
}

fn print_launcher(launcher: &config::LauncherConfig) {
    match (&launcher.program, &launcher.script) {
        (Some(program), _) => println!("  program: {program}"),
        (None, Some(script)) => {
            let interpreter = exec::launch::script_interpreter(launcher);
            println!(
                "  script: {} (interpreter {})",
                script.display(),
                interpreter.display()
            );
        }
        (None, None) => println!("  (not configured)"),
    }
    if let Some(prefix) = &launcher.conda_prefix {
        println!("  conda_prefix: {}", prefix.display());
    }
    for (key, value) in &launcher.env {
        println!("  env {key}={value}");
    }
}
