// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw
/// `RawConfigFile`.
///
/// This only performs TOML deserialization (including duration parsing); it
/// does **not** perform semantic validation. Use [`load_and_validate`] for
/// that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and run validation.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks pool sizing, upload limits, viewer port, trainer progress regex.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Load the config at `path` if it exists, otherwise fall back to the
/// built-in defaults. Used by the CLI so a bare `splatpipe check` works in an
/// empty directory.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    if path.exists() {
        load_and_validate(path)
    } else {
        tracing::info!(path = %path.display(), "config file not found; using defaults");
        ConfigFile::try_from(RawConfigFile::default())
    }
}

/// Default config path: `Splatpipe.toml` in the current working directory,
/// unless `SPLATPIPE_CONFIG` is set.
pub fn default_config_path() -> PathBuf {
    std::env::var_os("SPLATPIPE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("Splatpipe.toml"))
}
