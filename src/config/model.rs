// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::duration;
use crate::types::ViewerMode;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [storage]
/// data_dir = "data"
///
/// [training]
/// conda_prefix = "/opt/conda/envs/gaussian-splatting"
/// script = "/srv/gaussian-splatting/train.py"
/// iterations = 30000
///
/// [training.env]
/// CUDA_HOME = "${CONDA_PREFIX}"
///
/// [viewer]
/// script = "/srv/web-3dgs/main.py"
/// port = 8091
/// ```
///
/// All sections are optional and have defaults. This is the unvalidated
/// form; use [`ConfigFile`] (via `TryFrom`) everywhere else.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub upload: UploadSection,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub reconstruction: ReconstructionSection,

    #[serde(default)]
    pub training: TrainingSection,

    #[serde(default)]
    pub viewer: ViewerSection,
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub upload: UploadSection,
    pub pipeline: PipelineSection,
    pub reconstruction: ReconstructionSection,
    pub training: TrainingSection,
    pub viewer: ViewerSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            server: raw.server,
            storage: raw.storage,
            upload: raw.upload,
            pipeline: raw.pipeline,
            reconstruction: raw.reconstruction,
            training: raw.training,
            viewer: raw.viewer,
        }
    }

    /// Host the viewer binds to: `[viewer].host`, else `[server].host`.
    pub fn viewer_host(&self) -> &str {
        self.viewer.host.as_deref().unwrap_or(&self.server.host)
    }

    /// Host used when building URLs handed back to clients.
    pub fn public_host(&self) -> &str {
        self.server.public_host.as_deref().unwrap_or(&self.server.host)
    }

    /// Viewer log file: `[viewer].log_file`, else `<log_dir>/viewer.log`.
    pub fn viewer_log_file(&self) -> PathBuf {
        self.viewer
            .log_file
            .clone()
            .unwrap_or_else(|| self.storage.log_dir.join("viewer.log"))
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,

    /// Host name put into viewer URLs. Defaults to `host`.
    #[serde(default)]
    pub public_host: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            public_host: None,
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// Root for per-owner job directories (`<data_dir>/<owner>/<name>/`).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
        }
    }
}

/// `[upload]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    /// Lowercase extensions without the dot.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
}

fn default_allowed_extensions() -> Vec<String> {
    ["mp4", "avi", "mov", "mkv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_size_bytes() -> u64 {
    500 * 1024 * 1024
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

/// `[pipeline]` section: job pool sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    /// Pipelines allowed to run at the same time.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Admitted jobs allowed to wait for a free slot. Submissions beyond
    /// `max_concurrent_jobs + max_queued_jobs` are rejected.
    #[serde(default = "default_max_queued_jobs")]
    pub max_queued_jobs: usize,
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_max_queued_jobs() -> usize {
    16
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queued_jobs: default_max_queued_jobs(),
        }
    }
}

/// How to run one external program: either a `program` resolved on `PATH`
/// (or given as a path), or an `interpreter` running a `script`.
///
/// `conda_prefix` activates a conda environment without a shell: it sets
/// `CONDA_PREFIX`, prepends `<prefix>/bin` to `PATH` and makes
/// `<prefix>/bin/python` the default interpreter.
///
/// `env` values may reference other variables as `$VAR` or `${VAR}`; a
/// self-reference (`PATH = "$CUDA_HOME/bin:$PATH"`) expands to the inherited
/// value.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LauncherConfig {
    #[serde(default)]
    pub program: Option<String>,

    #[serde(default)]
    pub script: Option<PathBuf>,

    #[serde(default)]
    pub interpreter: Option<String>,

    #[serde(default)]
    pub conda_prefix: Option<PathBuf>,

    /// Defaults to the script's directory when a script is used.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One command line with `{placeholder}` arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandTemplate {
    /// Label used in logs and error messages. Defaults to the program name.
    #[serde(default)]
    pub name: Option<String>,

    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: Some(name.to_string()),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.program)
    }
}

/// `[reconstruction]` section.
///
/// Placeholders available to `frames` and `steps` arguments: `{video}`,
/// `{workspace}`, `{images}`, `{sparse}`, `{database}`, `{frame_interval}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconstructionSection {
    /// Keep one frame out of every `frame_interval`.
    #[serde(default = "default_frame_interval")]
    pub frame_interval: u32,

    #[serde(default = "default_true")]
    pub extract_frames: bool,

    #[serde(default = "default_frames_command")]
    pub frames: CommandTemplate,

    /// Ordered reconstruction commands, run after frame extraction.
    #[serde(default = "default_reconstruction_steps")]
    pub steps: Vec<CommandTemplate>,

    #[serde(default)]
    pub conda_prefix: Option<PathBuf>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Upper bound for the whole stage. Unbounded when absent.
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub timeout: Option<Duration>,
}

fn default_frame_interval() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_frames_command() -> CommandTemplate {
    CommandTemplate::new(
        "extract_frames",
        "ffmpeg",
        &[
            "-y",
            "-loglevel",
            "error",
            "-i",
            "{video}",
            "-vf",
            "select=not(mod(n\\,{frame_interval}))",
            "-vsync",
            "vfr",
            "-q:v",
            "2",
            "-start_number",
            "0",
            "{images}/frame_%06d.jpg",
        ],
    )
}

fn default_reconstruction_steps() -> Vec<CommandTemplate> {
    vec![
        CommandTemplate::new(
            "feature_extractor",
            "colmap",
            &[
                "feature_extractor",
                "--database_path",
                "{database}",
                "--image_path",
                "{images}",
                "--ImageReader.camera_model",
                "PINHOLE",
                "--ImageReader.single_camera",
                "1",
                "--SiftExtraction.max_image_size",
                "640",
            ],
        ),
        CommandTemplate::new(
            "exhaustive_matcher",
            "colmap",
            &["exhaustive_matcher", "--database_path", "{database}"],
        ),
        CommandTemplate::new(
            "mapper",
            "colmap",
            &[
                "mapper",
                "--database_path",
                "{database}",
                "--image_path",
                "{images}",
                "--output_path",
                "{sparse}",
            ],
        ),
    ]
}

impl Default for ReconstructionSection {
    fn default() -> Self {
        Self {
            frame_interval: default_frame_interval(),
            extract_frames: true,
            frames: default_frames_command(),
            steps: default_reconstruction_steps(),
            conda_prefix: None,
            working_dir: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }
}

/// `[training]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingSection {
    #[serde(flatten)]
    pub launcher: LauncherConfig,

    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Appended after `-s <colmap> -m <output> --iterations <n>`.
    #[serde(default = "default_training_extra_args")]
    pub extra_args: Vec<String>,

    /// Regex with one capture group holding a percentage, e.g.
    /// `"Training progress:\\s+(\\d+)%"`. Matches advance the task between
    /// 50 and 95 percent.
    #[serde(default)]
    pub progress_pattern: Option<String>,

    /// Upper bound for a training run. Unbounded when absent.
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub timeout: Option<Duration>,
}

fn default_iterations() -> u32 {
    30_000
}

fn default_training_extra_args() -> Vec<String> {
    vec!["--eval".to_string()]
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            iterations: default_iterations(),
            extra_args: default_training_extra_args(),
            progress_pattern: None,
            timeout: None,
        }
    }
}

/// `[viewer]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerSection {
    #[serde(flatten)]
    pub launcher: LauncherConfig,

    #[serde(default = "default_viewer_port")]
    pub port: u16,

    /// Bind host passed to the viewer. Defaults to `[server].host`.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub mode: ViewerMode,

    /// Defaults to `<log_dir>/viewer.log`. Only used in detached mode.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(
        default = "default_startup_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub startup_timeout: Duration,

    #[serde(
        default = "default_stop_grace",
        deserialize_with = "duration::deserialize"
    )]
    pub stop_grace: Duration,

    /// Size of the recent output buffer exposed by `status()`.
    #[serde(default = "default_recent_lines")]
    pub recent_lines: usize,
}

fn default_viewer_port() -> u16 {
    8091
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_recent_lines() -> usize {
    200
}

impl Default for ViewerSection {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            port: default_viewer_port(),
            host: None,
            mode: ViewerMode::default(),
            log_file: None,
            startup_timeout: default_startup_timeout(),
            stop_grace: default_stop_grace(),
            recent_lines: default_recent_lines(),
        }
    }
}
