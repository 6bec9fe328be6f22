//! The single local copy of the last downloaded artifact.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use licensor_core::keys::license_key_fingerprint;
use licensor_core::LicenseError;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

pub const DEFAULT_CACHE_PATH: &str = "./license.lic";

/// Diagnostics written next to the cache file. Never consulted for validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub fetched_at: DateTime<Utc>,
    pub license_key_fingerprint: String,
}

impl CacheMeta {
    pub fn new(fetched_at: DateTime<Utc>, license_key: &str) -> Self {
        Self {
            fetched_at,
            license_key_fingerprint: license_key_fingerprint(license_key),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    path: PathBuf,
}

impl ArtifactCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    /// Cached artifact text, or `None` when there is nothing usable on disk.
    pub fn load(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!(
                    "Cannot read license cache {}, treating as missing: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Replace the cached artifact atomically, then refresh the sidecar.
    /// Only the artifact write can fail the call.
    pub fn store(&self, artifact: &str, meta: &CacheMeta) -> Result<(), LicenseError> {
        write_atomic(&self.path, artifact.as_bytes())?;

        match serde_json::to_vec_pretty(meta) {
            Ok(json) => {
                if let Err(e) = write_atomic(&self.meta_path(), &json) {
                    log::warn!("Could not write cache metadata: {}", e);
                }
            }
            Err(e) => log::warn!("Could not serialize cache metadata: {}", e),
        }
        Ok(())
    }

    pub fn load_meta(&self) -> Option<CacheMeta> {
        let raw = fs::read(self.meta_path()).ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

/// Write through a temp file in the target directory and rename over the
/// target, so readers see either the old or the new content.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), LicenseError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
