//! Per-run staging directory with guaranteed removal.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::run::RunId;

/// Exclusive working directory for one run.
///
/// Removed by [`StagingDir::cleanup`] and again, as a fallback, on drop.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    removed: bool,
}

impl StagingDir {
    /// Create `<root>/nextcloud_backup_<run>`, including missing parents.
    ///
    /// The leaf directory must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created, the leaf already
    /// exists, or permissions forbid creation.
    pub fn create(root: &Path, run: &RunId) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create staging root {}", root.display()))?;

        let path = root.join(run.staging_dir_name());
        std::fs::create_dir(&path)
            .with_context(|| format!("failed to create staging directory {}", path.display()))?;

        info!(dir = %path.display(), "staging directory created");
        Ok(Self {
            path,
            removed: false,
        })
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the staging directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Directory name, used as the root entry of the packaged archive.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Delete the directory and everything under it. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn cleanup(&mut self) -> anyhow::Result<()> {
        if self.removed {
            return Ok(());
        }
        remove_dir_if_present(&self.path)
            .with_context(|| format!("failed to remove staging directory {}", self.path.display()))?;
        self.removed = true;
        debug!(dir = %self.path.display(), "staging directory removed");
        Ok(())
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(error = %e, "staging cleanup on drop failed");
        }
    }
}

/// Remove a directory tree; a path that does not exist is not an error.
///
/// # Errors
///
/// Returns any I/O error other than `NotFound`.
pub fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
