// src/pipeline/ingest.rs

//! Asset intake: validate a submitted video and copy it into the owner's
//! data directory as `<data_dir>/<owner>/<name>/input.<ext>`.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::errors::{Result, SplatError};

/// Name used when sanitising leaves nothing of the original file stem.
const FALLBACK_NAME: &str = "video";

/// A submitted file that passed validation but has not been copied yet.
#[derive(Debug, Clone)]
pub struct AssetCandidate {
    pub source: PathBuf,
    /// Sanitised file name, e.g. `my_clip.mp4`.
    pub original_filename: String,
    /// Sanitised stem; names the job directory.
    pub name: String,
    /// Lowercase extension without the dot.
    pub extension: String,
    pub size: u64,
}

/// A video copied into its job directory.
#[derive(Debug, Clone)]
pub struct IngestedAsset {
    pub asset_path: PathBuf,
    pub job_dir: PathBuf,
    pub name: String,
    pub original_filename: String,
}

#[derive(Debug, Clone)]
pub struct AssetIngest {
    data_dir: PathBuf,
    allowed_extensions: Vec<String>,
    max_size_bytes: u64,
}

impl AssetIngest {
    pub fn new(data_dir: impl Into<PathBuf>, allowed_extensions: Vec<String>, max_size_bytes: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
            max_size_bytes,
        }
    }

    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self::new(
            &cfg.storage.data_dir,
            cfg.upload.allowed_extensions.clone(),
            cfg.upload.max_size_bytes,
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// `<data_dir>/<owner>`.
    pub fn owner_dir(&self, owner: &str) -> PathBuf {
        self.data_dir.join(owner)
    }

    /// Check extension, existence and size of `source`.
    pub async fn validate(&self, source: &Path) -> Result<AssetCandidate> {
        let raw_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let extension = match raw_name.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => ext.to_ascii_lowercase(),
            _ => {
                return Err(SplatError::Validation(format!(
                    "'{}' has no file extension; allowed: {}",
                    raw_name,
                    self.allowed_extensions.join(", ")
                )));
            }
        };
        if !self.allowed_extensions.contains(&extension) {
            return Err(SplatError::Validation(format!(
                "unsupported file type '.{}'; allowed: {}",
                extension,
                self.allowed_extensions.join(", ")
            )));
        }

        let meta = fs::metadata(source).await.map_err(|e| {
            SplatError::Validation(format!("cannot read {}: {}", source.display(), e))
        })?;
        if !meta.is_file() {
            return Err(SplatError::Validation(format!(
                "{} is not a regular file",
                source.display()
            )));
        }
        if meta.len() > self.max_size_bytes {
            return Err(SplatError::Validation(format!(
                "{} is {} bytes; the limit is {} bytes",
                source.display(),
                meta.len(),
                self.max_size_bytes
            )));
        }

        let original_filename = secure_filename(&raw_name);
        let name = match original_filename.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => FALLBACK_NAME.to_string(),
        };

        Ok(AssetCandidate {
            source: source.to_path_buf(),
            original_filename,
            name,
            extension,
            size: meta.len(),
        })
    }

    /// Copy a validated candidate into `<data_dir>/<owner>/<name>/`.
    pub async fn ingest(&self, owner: &str, candidate: &AssetCandidate) -> Result<IngestedAsset> {
        validate_owner(owner)?;

        let job_dir = self.owner_dir(owner).join(&candidate.name);
        fs::create_dir_all(&job_dir).await?;
        let asset_path = job_dir.join(format!("input.{}", candidate.extension));

        debug!(
            owner,
            source = %candidate.source.display(),
            dest = %asset_path.display(),
            bytes = candidate.size,
            "copying asset"
        );
        fs::copy(&candidate.source, &asset_path).await?;
        info!(owner, path = %asset_path.display(), "asset stored");

        Ok(IngestedAsset {
            asset_path,
            job_dir,
            name: candidate.name.clone(),
            original_filename: candidate.original_filename.clone(),
        })
    }

    /// Remove the owner's job directories last modified more than
    /// `older_than` ago. Returns the removed directories.
    pub async fn prune(&self, owner: &str, older_than: Duration) -> Result<Vec<PathBuf>> {
        validate_owner(owner)?;

        let owner_dir = self.owner_dir(owner);
        if !fs::try_exists(&owner_dir).await? {
            return Ok(Vec::new());
        }

        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = Vec::new();
        let mut entries = fs::read_dir(&owner_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let modified = match meta.modified() {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "no mtime; skipping");
                    continue;
                }
            };
            if modified < cutoff {
                let path = entry.path();
                fs::remove_dir_all(&path).await?;
                info!(owner, path = %path.display(), "removed old job directory");
                removed.push(path);
            }
        }
        removed.sort();
        Ok(removed)
    }
}

/// Owners name a directory and prefix task ids, so they must be a single
/// plain path component.
pub fn validate_owner(owner: &str) -> Result<()> {
    let ok = !owner.is_empty()
        && owner != "."
        && owner != ".."
        && owner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(SplatError::Validation(format!(
            "invalid owner '{owner}': use letters, digits, '_', '-' or '.'"
        )))
    }
}

/// Reduce a client-supplied file name to a safe ASCII name.
///
/// Path separators become spaces, whitespace runs become `_`, anything
/// outside `[A-Za-z0-9_.-]` is dropped and leading/trailing `.`/`_` are
/// trimmed. May return an empty string.
pub fn secure_filename(name: &str) -> String {
    let spaced: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}
