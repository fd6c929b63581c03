//! Storage root and path resolution.

use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Environment variable overriding the data root.
pub const DATA_ROOT_ENV: &str = "PLEXMAP_DATA_ROOT";

/// Data root directory name under `$HOME` when the variable is unset.
pub const DEFAULT_DATA_DIR: &str = "PLEXMAP_DATA";

/// Expand a leading `~` and make the path absolute.
///
/// Existing paths are canonicalized (symlinks resolved); missing ones are
/// made absolute against the current directory.
#[must_use]
pub fn expand_path(path: &Path) -> PathBuf {
    let expanded = match (path.strip_prefix("~"), home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    };
    std::fs::canonicalize(&expanded)
        .or_else(|_| std::path::absolute(&expanded))
        .unwrap_or(expanded)
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Data root from [`DATA_ROOT_ENV`], else `$HOME/PLEXMAP_DATA`.
///
/// # Errors
///
/// Returns [`StoreError::InvalidRequest`] when neither the variable nor
/// `HOME` is set.
pub fn data_root_from_env() -> Result<PathBuf, StoreError> {
    if let Some(root) = std::env::var_os(DATA_ROOT_ENV).filter(|r| !r.is_empty()) {
        return Ok(expand_path(Path::new(&root)));
    }
    home_dir()
        .map(|home| expand_path(&home.join(DEFAULT_DATA_DIR)))
        .ok_or_else(|| {
            StoreError::InvalidRequest(format!(
                "set {DATA_ROOT_ENV} or HOME to locate the data root"
            ))
        })
}
