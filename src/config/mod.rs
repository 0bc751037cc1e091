// src/config/mod.rs

//! Configuration loading and validation for splatpipe.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate basic invariants like pool sizing and regexes (`validate.rs`).
//! - Parse duration strings (`duration.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{load_and_validate, load_from_path, load_or_default};
pub use model::{
    CommandTemplate, ConfigFile, LauncherConfig, PipelineSection, RawConfigFile,
    ReconstructionSection, ServerSection, StorageSection, TrainingSection, UploadSection,
    ViewerSection,
};
