// crates/test-utils/src/builders.rs

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use splatpipe::config::{CommandTemplate, ConfigFile, RawConfigFile};
use splatpipe::errors::Result;
use splatpipe::types::ViewerMode;

/// Builder for `ConfigFile` to simplify test setup.
///
/// Starts from the built-in defaults; every setter overrides one field.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    /// Point data and log directories inside `root` (usually a tempdir).
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.config.storage.data_dir = root.join("data");
        self.config.storage.log_dir = root.join("logs");
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.data_dir = dir.into();
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.pipeline.max_concurrent_jobs = n;
        self
    }

    pub fn max_queued_jobs(mut self, n: usize) -> Self {
        self.config.pipeline.max_queued_jobs = n;
        self
    }

    pub fn allowed_extensions(mut self, exts: &[&str]) -> Self {
        self.config.upload.allowed_extensions = exts.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn max_size_bytes(mut self, n: u64) -> Self {
        self.config.upload.max_size_bytes = n;
        self
    }

    pub fn extract_frames(mut self, enabled: bool) -> Self {
        self.config.reconstruction.extract_frames = enabled;
        self
    }

    pub fn frames_command(mut self, cmd: CommandTemplate) -> Self {
        self.config.reconstruction.frames = cmd;
        self
    }

    pub fn reconstruction_steps(mut self, steps: Vec<CommandTemplate>) -> Self {
        self.config.reconstruction.steps = steps;
        self
    }

    pub fn reconstruction_timeout(mut self, timeout: Duration) -> Self {
        self.config.reconstruction.timeout = Some(timeout);
        self
    }

    /// Run training as `program ...` instead of a script.
    pub fn training_program(mut self, program: impl Into<String>) -> Self {
        self.config.training.launcher.program = Some(program.into());
        self
    }

    pub fn training_script(mut self, script: impl Into<PathBuf>, interpreter: &str) -> Self {
        self.config.training.launcher.script = Some(script.into());
        self.config.training.launcher.interpreter = Some(interpreter.to_string());
        self
    }

    pub fn training_env(mut self, key: &str, value: &str) -> Self {
        self.config
            .training
            .launcher
            .env
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn iterations(mut self, n: u32) -> Self {
        self.config.training.iterations = n;
        self
    }

    pub fn training_extra_args(mut self, args: &[&str]) -> Self {
        self.config.training.extra_args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn progress_pattern(mut self, pattern: &str) -> Self {
        self.config.training.progress_pattern = Some(pattern.to_string());
        self
    }

    pub fn training_timeout(mut self, timeout: Duration) -> Self {
        self.config.training.timeout = Some(timeout);
        self
    }

    pub fn viewer_script(mut self, script: impl Into<PathBuf>, interpreter: &str) -> Self {
        self.config.viewer.launcher.script = Some(script.into());
        self.config.viewer.launcher.interpreter = Some(interpreter.to_string());
        self
    }

    pub fn viewer_port(mut self, port: u16) -> Self {
        self.config.viewer.port = port;
        self
    }

    pub fn viewer_host(mut self, host: &str) -> Self {
        self.config.viewer.host = Some(host.to_string());
        self
    }

    pub fn public_host(mut self, host: &str) -> Self {
        self.config.server.public_host = Some(host.to_string());
        self
    }

    pub fn viewer_mode(mut self, mode: ViewerMode) -> Self {
        self.config.viewer.mode = mode;
        self
    }

    pub fn viewer_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.viewer.log_file = Some(path.into());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.viewer.startup_timeout = timeout;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.viewer.stop_grace = grace;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
