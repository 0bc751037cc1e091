// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::parse_duration;

/// Command-line arguments for `splatpipe`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "splatpipe",
    version,
    about = "Turn videos into Gaussian-splat models and serve them in a viewer.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `$SPLATPIPE_CONFIG`, else `Splatpipe.toml` in the current
    /// working directory. Built-in defaults are used if the file is missing.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SPLATPIPE_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the full pipeline for one or more videos and wait for them.
    Run {
        /// Owner the tasks and data directories belong to.
        #[arg(long, value_name = "NAME")]
        owner: String,

        /// Print final task records as JSON instead of a summary.
        #[arg(long)]
        json: bool,

        #[arg(required = true, value_name = "VIDEO")]
        videos: Vec<PathBuf>,
    },

    /// Serve a trained `.ply` in the viewer until Ctrl-C.
    View {
        #[arg(value_name = "ARTIFACT")]
        artifact: PathBuf,
    },

    /// Terminate whatever listens on a TCP port.
    FreePort {
        port: u16,

        /// Time to wait after SIGTERM before SIGKILL.
        #[arg(long, default_value = "5s", value_parser = parse_duration_arg)]
        grace: Duration,
    },

    /// Delete an owner's job directories older than a given age.
    Prune {
        #[arg(long, value_name = "NAME")]
        owner: String,

        #[arg(long, default_value = "7d", value_parser = parse_duration_arg)]
        older_than: Duration,
    },

    /// Parse + validate the config and print a summary, without running
    /// anything.
    Check,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s)
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
