// src/config/validate.rs

use regex::Regex;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{Result, SplatError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::SplatError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_pipeline(cfg)?;
    validate_upload(cfg)?;
    validate_reconstruction(cfg)?;
    validate_training(cfg)?;
    validate_viewer(cfg)?;
    Ok(())
}

fn validate_pipeline(cfg: &RawConfigFile) -> Result<()> {
    if cfg.pipeline.max_concurrent_jobs == 0 {
        return Err(SplatError::ConfigError(
            "[pipeline].max_concurrent_jobs must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_upload(cfg: &RawConfigFile) -> Result<()> {
    if cfg.upload.allowed_extensions.is_empty() {
        return Err(SplatError::ConfigError(
            "[upload].allowed_extensions must list at least one extension".to_string(),
        ));
    }
    for ext in &cfg.upload.allowed_extensions {
        if ext.is_empty() || ext.starts_with('.') {
            return Err(SplatError::ConfigError(format!(
                "[upload].allowed_extensions entry '{}' must be a bare extension like \"mp4\"",
                ext
            )));
        }
    }
    if cfg.upload.max_size_bytes == 0 {
        return Err(SplatError::ConfigError(
            "[upload].max_size_bytes must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_reconstruction(cfg: &RawConfigFile) -> Result<()> {
    let rc = &cfg.reconstruction;
    if rc.frame_interval == 0 {
        return Err(SplatError::ConfigError(
            "[reconstruction].frame_interval must be >= 1 (got 0)".to_string(),
        ));
    }
    if rc.steps.is_empty() {
        return Err(SplatError::ConfigError(
            "[reconstruction] needs at least one entry in `steps`".to_string(),
        ));
    }
    for step in rc.steps.iter().chain(std::iter::once(&rc.frames)) {
        if step.program.trim().is_empty() {
            return Err(SplatError::ConfigError(format!(
                "[reconstruction] command '{}' has an empty `program`",
                step.label()
            )));
        }
    }
    Ok(())
}

fn validate_training(cfg: &RawConfigFile) -> Result<()> {
    if cfg.training.iterations == 0 {
        return Err(SplatError::ConfigError(
            "[training].iterations must be >= 1 (got 0)".to_string(),
        ));
    }

    if let Some(pattern) = &cfg.training.progress_pattern {
        let re = Regex::new(pattern).map_err(|e| {
            SplatError::ConfigError(format!(
                "[training].progress_pattern '{}' is not a valid regex: {}",
                pattern, e
            ))
        })?;
        if re.captures_len() < 2 {
            return Err(SplatError::ConfigError(format!(
                "[training].progress_pattern '{}' needs a capture group for the percentage",
                pattern
            )));
        }
    }
    Ok(())
}

fn validate_viewer(cfg: &RawConfigFile) -> Result<()> {
    if cfg.viewer.port == 0 {
        return Err(SplatError::ConfigError(
            "[viewer].port must be a fixed port (got 0)".to_string(),
        ));
    }
    if cfg.viewer.startup_timeout.is_zero() {
        return Err(SplatError::ConfigError(
            "[viewer].startup_timeout must be greater than zero".to_string(),
        ));
    }
    if cfg.viewer.recent_lines == 0 {
        return Err(SplatError::ConfigError(
            "[viewer].recent_lines must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}
