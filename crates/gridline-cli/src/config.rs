//! Configuration file discovery.

use anyhow::{Context, Result, bail};
use gridline_core::config::MatrixConfig;
use std::path::{Path, PathBuf};

const CANDIDATES: &[&str] = &[
    ".gridline/matrix.yaml",
    ".gridline/matrix.yml",
    "gridline.yaml",
    "gridline.yml",
    ".gridline.yaml",
];

/// Resolve the configuration file: an explicit path must exist, otherwise
/// the standard locations are searched relative to the working directory.
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    find_in(Path::new("."), explicit)
}

fn find_in(root: &Path, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        bail!("configuration file {} does not exist", path.display());
    }

    CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file())
        .with_context(|| {
            format!(
                "no configuration file found; looked for {}",
                CANDIDATES.join(", ")
            )
        })
}

pub fn load(path: &Path) -> Result<MatrixConfig> {
    MatrixConfig::from_file(path).with_context(|| format!("invalid configuration in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_order() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_in(dir.path(), None).is_err());

        std::fs::write(dir.path().join("gridline.yml"), "package: ibis").unwrap();
        assert_eq!(find_in(dir.path(), None).unwrap(), dir.path().join("gridline.yml"));

        std::fs::create_dir(dir.path().join(".gridline")).unwrap();
        std::fs::write(dir.path().join(".gridline/matrix.yaml"), "package: ibis").unwrap();
        assert_eq!(
            find_in(dir.path(), None).unwrap(),
            dir.path().join(".gridline/matrix.yaml")
        );
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(find_in(dir.path(), Some(&missing)).is_err());
    }
}
