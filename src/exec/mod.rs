// src/exec/mod.rs

//! Process execution layer.
//!
//! Everything that touches external programs goes through here:
//!
//! - [`launch`] turns configuration into a structured [`LaunchSpec`]
//!   (argv, env map, working directory; no shell).
//! - [`process`] owns [`ManagedProcess`], the supervisor for one OS process.
//! - [`output`] holds the bounded [`OutputBuffer`] of recent lines.
//! - [`tailer`] follows a log file for processes whose output is not piped.
//! - [`signal`] wraps `kill(2)` for pids we did not spawn ourselves.

pub mod launch;
pub mod output;
pub mod process;
pub mod signal;
pub mod tailer;

pub use launch::{activation_env, expand_env_with, render_args, resolve_env, LaunchSpec};
pub use output::OutputBuffer;
pub use process::{LineObserver, ManagedProcess, OutputMode, StartOptions, DIAGNOSTIC_LINES};
pub use tailer::LogTailer;
