//! Dataset registry: manifests binding a dataset id to its source files.
//!
//! Layout under the data root:
//!
//! ```text
//! <root>/<dataset_id>/manifest.json
//! <root>/<dataset_id>/raw/         copied sources (when requested)
//! <root>/<dataset_id>/processed/   default output root for artifacts
//! <root>/legacy/                   output root for path-only requests
//! ```
//!
//! Each manifest records a size + mtime signature per source file. A
//! signature that no longer matches the live file makes the dataset stale.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use plexmap_pipeline::ColumnNames;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::write_atomic;
use crate::config::{data_root_from_env, expand_path};
use crate::error::StoreError;
use crate::source::table_columns;

pub const MANIFEST_NAME: &str = "manifest.json";
pub const RAW_DIR: &str = "raw";
pub const PROCESSED_DIR: &str = "processed";
pub const LEGACY_DIR: &str = "legacy";
pub const MARKER_COLUMNS_KEY: &str = "marker_columns";

/// Allowed difference between a recorded and a live mtime, in seconds.
pub const MTIME_TOLERANCE: f64 = 1e-6;

/// Size and modification time of a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSignature {
    pub path: PathBuf,
    pub size: u64,
    /// Fractional seconds since the Unix epoch.
    pub mtime: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<PathBuf>,
}

impl FileSignature {
    /// Signature of the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be inspected.
    pub fn of(path: &Path) -> Result<Self, StoreError> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            mtime: unix_seconds(meta.modified()?),
            original_path: None,
        })
    }

    /// The file the user supplied: `original_path` when recorded, else
    /// `path`.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        self.original_path.as_deref().unwrap_or(&self.path)
    }

    /// Whether the live file at `path` still has this size and mtime.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        fs::metadata(path).is_ok_and(|meta| {
            meta.len() == self.size
                && meta
                    .modified()
                    .is_ok_and(|m| (unix_seconds(m) - self.mtime).abs() < MTIME_TOLERANCE)
        })
    }
}

fn unix_seconds(time: std::time::SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Signatures of both source files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub image: FileSignature,
    pub table: FileSignature,
    pub copied: bool,
}

/// Persisted record of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub dataset_id: String,
    pub image_path: PathBuf,
    pub table_path: PathBuf,
    pub output_root: PathBuf,
    pub source_info: SourceInfo,
    /// RFC 3339 UTC timestamp.
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Resolved paths for one analysis invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetContext {
    /// `None` for path-only requests.
    pub dataset_id: Option<String>,
    pub image_path: PathBuf,
    pub table_path: PathBuf,
    pub output_root: PathBuf,
}

/// What [`Registry::clear_cache`] removed. Only copies under `raw/` are
/// ever deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub processed: bool,
    pub raw_files_deleted: Vec<PathBuf>,
}

/// Options for [`Registry::ingest`].
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Requested id; derived from the image file name when `None`.
    pub dataset_id: Option<String>,
    /// Copy sources into the dataset's `raw/` directory.
    pub copy_files: bool,
    /// Columns read as numbers; every other table column is recorded under
    /// `metadata.marker_columns`.
    pub columns: ColumnNames,
    pub metadata: Map<String, Value>,
}

/// Normalize a dataset id: runs of characters outside `[A-Za-z0-9_-]`
/// become `-`, leading and trailing `-` are trimmed, the result is
/// lowercased, and an empty id becomes `dataset`.
#[must_use]
pub fn sanitize_dataset_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "dataset".to_owned()
    } else {
        trimmed.to_lowercase()
    }
}

/// Datasets stored under one data root.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    /// Open the registry at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = expand_path(root.as_ref());
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: expand_path(&root),
        })
    }

    /// Open the registry at the environment-configured data root.
    ///
    /// # Errors
    ///
    /// See [`data_root_from_env`] and [`new`](Self::new).
    pub fn from_env() -> Result<Self, StoreError> {
        Self::new(data_root_from_env()?)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(sanitize_dataset_id(dataset_id))
    }

    #[must_use]
    pub fn manifest_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_dir(dataset_id).join(MANIFEST_NAME)
    }

    /// A free id derived from the image file stem: `<stem>`, `<stem>-1`, ...
    #[must_use]
    pub fn suggest_dataset_id(&self, image_path: &Path) -> String {
        let stem = image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = sanitize_dataset_id(&stem);
        let mut candidate = base.clone();
        let mut counter = 1;
        while self.root.join(&candidate).join(MANIFEST_NAME).exists() {
            candidate = format!("{base}-{counter}");
            counter += 1;
        }
        candidate
    }

    /// Read a dataset's manifest.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no manifest exists, or a JSON
    /// error if it is malformed.
    pub fn load_manifest(&self, dataset_id: &str) -> Result<Manifest, StoreError> {
        let path = self.manifest_path(dataset_id);
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::not_found("dataset manifest", &path),
            _ => e.into(),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save_manifest(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let path = self.manifest_path(&manifest.dataset_id);
        write_atomic(&path, serde_json::to_string_pretty(manifest)?.as_bytes())?;
        tracing::debug!(path = %path.display(), "wrote manifest");
        Ok(())
    }

    /// Register an image + table pair and write its manifest.
    ///
    /// Re-ingesting an existing id returns the stored manifest only when the
    /// same source files are given and they, and any copies, still match
    /// their recorded signatures.
    ///
    /// The table header is read to record its non-numeric columns under
    /// `metadata.marker_columns`, unless the caller supplied that key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if a source is missing,
    /// [`StoreError::Conflict`] if the id exists with different data, a CSV
    /// error for an unreadable table header, or an I/O error while copying
    /// or writing.
    pub fn ingest(
        &self,
        image_path: &Path,
        table_path: &Path,
        options: IngestOptions,
    ) -> Result<Manifest, StoreError> {
        let src_image = expand_path(image_path);
        let src_table = expand_path(table_path);
        if !src_image.exists() {
            return Err(StoreError::not_found("image file", src_image));
        }
        if !src_table.exists() {
            return Err(StoreError::not_found("table file", src_table));
        }

        let dataset_id = match options.dataset_id.as_deref() {
            Some(requested) => {
                let id = sanitize_dataset_id(requested);
                if self.manifest_path(&id).exists() {
                    let existing = self.load_manifest(&id)?;
                    if same_sources(&existing, &src_image, &src_table) {
                        tracing::info!(dataset_id = %id, "dataset already ingested");
                        return Ok(existing);
                    }
                    return Err(StoreError::Conflict(id));
                }
                id
            }
            None => self.suggest_dataset_id(&src_image),
        };

        let mut metadata = options.metadata;
        if !metadata.contains_key(MARKER_COLUMNS_KEY) {
            let numeric = options.columns.numeric();
            let markers: Vec<Value> = table_columns(&src_table)?
                .into_iter()
                .filter(|name| !numeric.contains(&name.as_str()))
                .map(Value::String)
                .collect();
            metadata.insert(MARKER_COLUMNS_KEY.to_owned(), Value::Array(markers));
        }

        let base = self.dataset_dir(&dataset_id);
        let raw_dir = base.join(RAW_DIR);
        let processed_dir = base.join(PROCESSED_DIR);
        fs::create_dir_all(&raw_dir)?;
        fs::create_dir_all(&processed_dir)?;

        let (image, table) = if options.copy_files {
            (
                copy_preserving_mtime(&src_image, &raw_dir)?,
                copy_preserving_mtime(&src_table, &raw_dir)?,
            )
        } else {
            (src_image.clone(), src_table.clone())
        };

        let signed = |path: &Path, original: &Path| -> Result<FileSignature, StoreError> {
            Ok(FileSignature {
                original_path: Some(original.to_path_buf()),
                ..FileSignature::of(path)?
            })
        };
        let manifest = Manifest {
            dataset_id: dataset_id.clone(),
            source_info: SourceInfo {
                image: signed(&image, &src_image)?,
                table: signed(&table, &src_table)?,
                copied: options.copy_files,
            },
            image_path: image,
            table_path: table,
            output_root: processed_dir,
            created_at: chrono::Utc::now().to_rfc3339(),
            metadata,
        };
        self.save_manifest(&manifest)?;
        tracing::info!(%dataset_id, copied = options.copy_files, "ingested dataset");
        Ok(manifest)
    }

    /// Paths of an ingested dataset, after checking source integrity.
    ///
    /// Creates the output root if it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for a missing manifest or source,
    /// or [`StoreError::Integrity`] when a source changed.
    pub fn get_dataset_paths(&self, dataset_id: &str) -> Result<DatasetContext, StoreError> {
        let manifest = self.load_manifest(dataset_id)?;
        let image = expand_path(&manifest.image_path);
        let table = expand_path(&manifest.table_path);
        let output_root = expand_path(&manifest.output_root);
        if !image.exists() {
            return Err(StoreError::not_found(
                &format!("dataset '{dataset_id}' image"),
                image,
            ));
        }
        if !table.exists() {
            return Err(StoreError::not_found(
                &format!("dataset '{dataset_id}' table"),
                table,
            ));
        }
        for (role, signature, path) in [
            ("image", &manifest.source_info.image, &image),
            ("table", &manifest.source_info.table, &table),
        ] {
            if !signature.matches(path) {
                return Err(StoreError::Integrity {
                    dataset_id: manifest.dataset_id.clone(),
                    role: role.to_owned(),
                    path: path.clone(),
                });
            }
        }
        fs::create_dir_all(&output_root)?;
        Ok(DatasetContext {
            dataset_id: Some(manifest.dataset_id),
            image_path: image,
            table_path: table,
            output_root,
        })
    }

    /// Resolve either a dataset id or explicit source paths.
    ///
    /// Without an id, both paths are required and the output root defaults
    /// to `<root>/legacy`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRequest`] when neither an id nor both
    /// paths are given, [`StoreError::NotFound`] for missing sources, or
    /// any error from [`get_dataset_paths`](Self::get_dataset_paths).
    pub fn resolve(
        &self,
        dataset_id: Option<&str>,
        image_path: Option<&Path>,
        table_path: Option<&Path>,
        output_root: Option<&Path>,
    ) -> Result<DatasetContext, StoreError> {
        if let Some(id) = dataset_id.filter(|id| !id.is_empty()) {
            return self.get_dataset_paths(id);
        }
        let (Some(image), Some(table)) = (image_path, table_path) else {
            return Err(StoreError::InvalidRequest(
                "image and table paths are required when no dataset id is given".into(),
            ));
        };
        let image = expand_path(image);
        let table = expand_path(table);
        if !image.exists() {
            return Err(StoreError::not_found("image file", image));
        }
        if !table.exists() {
            return Err(StoreError::not_found("table file", table));
        }
        let output_root = output_root.map_or_else(|| self.root.join(LEGACY_DIR), expand_path);
        fs::create_dir_all(&output_root)?;
        Ok(DatasetContext {
            dataset_id: None,
            image_path: image,
            table_path: table,
            output_root,
        })
    }

    /// Ids of every directory under the root holding a manifest.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the root cannot be read.
    pub fn list_datasets(&self) -> Result<impl Iterator<Item = String>, StoreError> {
        let entries = fs::read_dir(&self.root)?;
        Ok(entries.filter_map(Result::ok).filter_map(|entry| {
            let path = entry.path();
            (path.is_dir() && path.join(MANIFEST_NAME).exists())
                .then(|| entry.file_name().to_string_lossy().into_owned())
        }))
    }

    /// Remove a dataset's processed artifacts, and optionally the source
    /// copies made at ingest.
    ///
    /// The processed directory is recreated empty. `delete_raw` only touches
    /// files under the dataset's `raw/` directory; sources registered in
    /// place are never deleted. Failing to delete a copy is logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown dataset or an I/O
    /// error while recreating the processed directory.
    pub fn clear_cache(&self, dataset_id: &str, delete_raw: bool) -> Result<ClearReport, StoreError> {
        let manifest = self.load_manifest(dataset_id)?;
        let processed = expand_path(&manifest.output_root);
        let mut report = ClearReport::default();
        if processed.exists() {
            match fs::remove_dir_all(&processed) {
                Ok(()) => report.processed = true,
                Err(err) => tracing::warn!(path = %processed.display(), %err, "failed to remove processed outputs"),
            }
        }
        fs::create_dir_all(&processed)?;

        if delete_raw {
            let raw_dir = self.dataset_dir(&manifest.dataset_id).join(RAW_DIR);
            report.raw_files_deleted = delete_copies(&manifest, &raw_dir);
        }
        tracing::info!(
            dataset_id,
            processed = report.processed,
            raw_deleted = report.raw_files_deleted.len(),
            "cleared cache"
        );
        Ok(report)
    }
}

/// Delete the `raw/` copies of a dataset's sources. Files registered in
/// place are left alone.
fn delete_copies(manifest: &Manifest, raw_dir: &Path) -> Vec<PathBuf> {
    if !manifest.source_info.copied {
        tracing::warn!(
            dataset_id = %manifest.dataset_id,
            "sources were registered in place; leaving them untouched"
        );
        return Vec::new();
    }
    let mut deleted = Vec::new();
    for path in [&manifest.image_path, &manifest.table_path] {
        let path = expand_path(path);
        if !path.starts_with(raw_dir) {
            tracing::warn!(path = %path.display(), "source outside raw directory; leaving it");
            continue;
        }
        if !path.exists() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => deleted.push(path),
            Err(err) => tracing::warn!(path = %path.display(), %err, "failed to delete source copy"),
        }
    }
    deleted
}

/// Whether `image` and `table` are the files recorded in `manifest`, with
/// the recorded size and mtime, and the registered files are unchanged.
fn same_sources(manifest: &Manifest, image: &Path, table: &Path) -> bool {
    let info = &manifest.source_info;
    [(&info.image, image), (&info.table, table)]
        .into_iter()
        .all(|(signature, src)| {
            expand_path(signature.source_path()).as_path() == src && signature.matches(src)
        })
        && sources_intact(manifest)
}

fn sources_intact(manifest: &Manifest) -> bool {
    manifest
        .source_info
        .image
        .matches(&expand_path(&manifest.image_path))
        && manifest
            .source_info
            .table
            .matches(&expand_path(&manifest.table_path))
}

/// Copy `src` into `dir`, keeping its modification time.
fn copy_preserving_mtime(src: &Path, dir: &Path) -> Result<PathBuf, StoreError> {
    let name = src
        .file_name()
        .ok_or_else(|| StoreError::InvalidRequest(format!("not a file: {}", src.display())))?;
    let dst = dir.join(name);
    fs::copy(src, &dst)?;
    let modified = fs::metadata(src)?.modified()?;
    fs::File::options()
        .write(true)
        .open(&dst)?
        .set_modified(modified)?;
    Ok(dst)
}
