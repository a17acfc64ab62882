//! Private, writable copies of the shared test-data tree.

use gridline_core::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

/// A staged copy of the asset tree. The copy is removed when dropped, so
/// cleanup happens on every exit path including cancellation.
#[derive(Debug)]
pub struct StagedAssets {
    dir: TempDir,
    files: usize,
}

impl StagedAssets {
    /// Copy `source` (if any) into a fresh temporary directory.
    ///
    /// The source tree is only ever read. Copied files are made writable so
    /// tests may mutate them freely.
    pub fn stage(source: Option<&Path>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("gridline-assets-")
            .tempdir()
            .map_err(|e| Error::Internal(format!("Failed to create staging dir: {}", e)))?;

        let mut files = 0;
        if let Some(source) = source {
            if !source.is_dir() {
                return Err(Error::Internal(format!(
                    "Asset directory {} does not exist",
                    source.display()
                )));
            }

            for entry in WalkDir::new(source).follow_links(true) {
                let entry = entry.map_err(|e| {
                    Error::Internal(format!("Failed to walk {}: {}", source.display(), e))
                })?;
                let relative = entry
                    .path()
                    .strip_prefix(source)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let target = dir.path().join(relative);

                if entry.file_type().is_dir() {
                    fs::create_dir_all(&target)?;
                } else {
                    fs::copy(entry.path(), &target)?;
                    make_writable(&target)?;
                    files += 1;
                }
            }
        }

        info!(
            source = ?source.map(|s| s.display().to_string()),
            staged = %dir.path().display(),
            files,
            "Assets staged"
        );

        Ok(Self { dir, files })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn files(&self) -> usize {
        self.files
    }

    /// Location for per-run outputs (reports, coverage) inside the copy.
    pub fn output_dir(&self) -> Result<PathBuf> {
        let out = self.dir.path().join(".gridline");
        fs::create_dir_all(&out)?;
        Ok(out)
    }
}

impl Drop for StagedAssets {
    fn drop(&mut self) {
        debug!(staged = %self.dir.path().display(), "Removing staged assets");
    }
}

fn make_writable(path: &Path) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}
