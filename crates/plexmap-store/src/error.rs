//! Error type for registry, cache and file operations.

use std::path::PathBuf;

use plexmap_pipeline::AnalysisError;

/// Errors surfaced by `plexmap-store`.
///
/// Not-found, integrity and conflict errors are always propagated to the
/// caller; only cache persistence failures are downgraded to warnings.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A source file, dataset or manifest does not exist.
    #[error("{what} not found: {}", path.display())]
    NotFound { what: String, path: PathBuf },

    /// A source file changed since the dataset was ingested.
    #[error(
        "dataset '{dataset_id}' {role} file changed or missing ({}); re-ingest to refresh caches",
        path.display()
    )]
    Integrity {
        dataset_id: String,
        role: String,
        path: PathBuf,
    },

    /// An existing dataset id is bound to different source files.
    #[error("dataset id '{0}' already exists with different data; choose another dataset id")]
    Conflict(String),

    /// The request is missing inputs or combines them inconsistently.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A cached artifact could not be decoded.
    #[error("artifact codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl StoreError {
    pub(crate) fn not_found(what: &str, path: impl Into<PathBuf>) -> Self {
        Self::NotFound {
            what: what.to_owned(),
            path: path.into(),
        }
    }
}
