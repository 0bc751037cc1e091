// tests/cli_args.rs

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use splatpipe::cli::{CliArgs, Command, LogLevel};
use splatpipe::logging::resolve_level;

#[test]
fn run_takes_owner_and_videos() {
    let args = CliArgs::try_parse_from([
        "splatpipe",
        "--config",
        "site.toml",
        "run",
        "--owner",
        "alice",
        "--json",
        "a.mp4",
        "b.mov",
    ])
    .unwrap();

    assert_eq!(args.config, Some(PathBuf::from("site.toml")));
    match args.command {
        Command::Run {
            owner,
            json,
            videos,
        } => {
            assert_eq!(owner, "alice");
            assert!(json);
            assert_eq!(videos, vec![PathBuf::from("a.mp4"), PathBuf::from("b.mov")]);
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn run_requires_at_least_one_video() {
    assert!(CliArgs::try_parse_from(["splatpipe", "run", "--owner", "alice"]).is_err());
}

#[test]
fn global_flags_work_after_the_subcommand() {
    let args =
        CliArgs::try_parse_from(["splatpipe", "check", "--log-level", "debug"]).unwrap();
    assert!(matches!(args.command, Command::Check));
    assert!(matches!(args.log_level, Some(LogLevel::Debug)));
}

#[test]
fn durations_parse_with_defaults() {
    let args = CliArgs::try_parse_from(["splatpipe", "free-port", "8091"]).unwrap();
    match args.command {
        Command::FreePort { port, grace } => {
            assert_eq!(port, 8091);
            assert_eq!(grace, Duration::from_secs(5));
        }
        other => panic!("unexpected command {other:?}"),
    }

    let args = CliArgs::try_parse_from([
        "splatpipe",
        "prune",
        "--owner",
        "alice",
        "--older-than",
        "12h",
    ])
    .unwrap();
    match args.command {
        Command::Prune { owner, older_than } => {
            assert_eq!(owner, "alice");
            assert_eq!(older_than, Duration::from_secs(12 * 3600));
        }
        other => panic!("unexpected command {other:?}"),
    }

    assert!(CliArgs::try_parse_from(["splatpipe", "free-port", "8091", "--grace", "soon"]).is_err());
}

#[test]
fn log_level_priority() {
    assert_eq!(
        resolve_level(Some(LogLevel::Warn), Some("trace")),
        tracing::Level::WARN
    );
    assert_eq!(resolve_level(None, Some(" DEBUG ")), tracing::Level::DEBUG);
    assert_eq!(resolve_level(None, Some("warning")), tracing::Level::WARN);
    assert_eq!(resolve_level(None, Some("loud")), tracing::Level::INFO);
    assert_eq!(resolve_level(None, None), tracing::Level::INFO);
}
