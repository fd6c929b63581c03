//! Derived-artifact cache.
//!
//! Every artifact has a deterministic [`CacheKey`]. [`ArtifactCache`]
//! loads the stored blob when present (unless forced), otherwise computes,
//! encodes and saves it. The backing [`ArtifactStore`] is injectable: the
//! filesystem in production, memory in tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::codec::Artifact;
use crate::error::StoreError;

/// The kind of an artifact plus the numeric parameters it depends on.
///
/// Sigma and radius are rounded to whole pixels in keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactKind {
    Labels,
    Mask,
    Density { sigma: u64 },
    Boundary { sigma: u64, percentile: f64 },
    Neighborhood { radius: u64 },
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn round_tag(value: f64) -> u64 {
    value.round().max(0.0) as u64
}

/// File-name form of a marker column name.
///
/// Bytes outside `[A-Za-z0-9_.-]` become `%XX` (uppercase hex), so distinct
/// markers always map to distinct names.
#[must_use]
pub fn encode_marker(marker: &str) -> String {
    let mut out = String::with_capacity(marker.len());
    for byte in marker.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Write `bytes` to `target` through a synced temporary sibling and a
/// rename, so readers see the old content or the new, never a partial file.
///
/// # Errors
///
/// Returns an I/O error if the parent directory cannot be created or the
/// write, sync or rename fails.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let name = target
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("artifact"))
        .to_string_lossy();
    let tmp = parent.join(format!(".{name}.tmp-{}", std::process::id()));
    let written = std::fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|()| std::fs::rename(&tmp, target)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Identity of one cached artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheKey {
    pub image_stem: String,
    pub marker: Option<String>,
    pub kind: ArtifactKind,
}

impl CacheKey {
    #[must_use]
    pub fn labels(image_stem: &str) -> Self {
        Self {
            image_stem: image_stem.to_owned(),
            marker: None,
            kind: ArtifactKind::Labels,
        }
    }

    #[must_use]
    pub fn mask(image_stem: &str, marker: &str) -> Self {
        Self::with_marker(image_stem, marker, ArtifactKind::Mask)
    }

    #[must_use]
    pub fn density(image_stem: &str, marker: &str, sigma: f64) -> Self {
        Self::with_marker(
            image_stem,
            marker,
            ArtifactKind::Density {
                sigma: round_tag(sigma),
            },
        )
    }

    #[must_use]
    pub fn boundary(image_stem: &str, marker: &str, sigma: f64, percentile: f64) -> Self {
        Self::with_marker(
            image_stem,
            marker,
            ArtifactKind::Boundary {
                sigma: round_tag(sigma),
                percentile,
            },
        )
    }

    #[must_use]
    pub fn neighborhood(image_stem: &str, marker: &str, radius: f64) -> Self {
        Self::with_marker(
            image_stem,
            marker,
            ArtifactKind::Neighborhood {
                radius: round_tag(radius),
            },
        )
    }

    fn with_marker(image_stem: &str, marker: &str, kind: ArtifactKind) -> Self {
        Self {
            image_stem: image_stem.to_owned(),
            marker: Some(marker.to_owned()),
            kind,
        }
    }

    /// File name of the artifact inside its image directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        let stem = &self.image_stem;
        let marker = encode_marker(self.marker.as_deref().unwrap_or_default());
        match &self.kind {
            ArtifactKind::Labels => format!("{stem}_rebuilt_labels.tif"),
            ArtifactKind::Mask => format!("{stem}_{marker}_mask.tif"),
            ArtifactKind::Density { sigma } => {
                format!("{stem}_{marker}_density_sigma{sigma}.tif")
            }
            ArtifactKind::Boundary { sigma, percentile } => {
                format!("{stem}_{marker}_density_boundary_sigma{sigma}_p{percentile}.json.gz")
            }
            ArtifactKind::Neighborhood { radius } => {
                format!("{stem}_{marker}_neighborhood_yx_r{radius}.json.gz")
            }
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Blob storage behind the cache.
pub trait ArtifactStore {
    /// Stored bytes for `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails for a reason other
    /// than absence.
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `bytes` under `key`, replacing any previous value whole.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn save(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), StoreError>;

    /// Human-readable location of `key` (a file path for [`FsStore`]).
    fn locate(&self, key: &CacheKey) -> String;

    /// Number of successful loads and saves so far.
    fn stats(&self) -> StoreStats;
}

/// Load and save counters of an [`ArtifactStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub loads: usize,
    pub saves: usize,
}

#[derive(Debug, Default)]
struct Counters {
    loads: Cell<usize>,
    saves: Cell<usize>,
}

impl Counters {
    fn load(&self) {
        self.loads.set(self.loads.get() + 1);
    }
    fn save(&self) {
        self.saves.set(self.saves.get() + 1);
    }
    fn stats(&self) -> StoreStats {
        StoreStats {
            loads: self.loads.get(),
            saves: self.saves.get(),
        }
    }
}

/// Artifacts as files under `<output_root>/<image_stem>/`.
///
/// Writes go through [`write_atomic`].
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    counters: Counters,
}

impl FsStore {
    #[must_use]
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            root: output_root.into(),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of the artifact file for `key`.
    #[must_use]
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.image_stem).join(key.file_name())
    }
}

impl ArtifactStore for FsStore {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => {
                self.counters.load();
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.path_for(key), bytes)?;
        self.counters.save();
        Ok(())
    }

    fn locate(&self, key: &CacheKey) -> String {
        self.path_for(key).display().to_string()
    }

    fn stats(&self) -> StoreStats {
        self.counters.stats()
    }
}

/// In-memory store for tests and ephemeral use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RefCell<BTreeMap<String, Vec<u8>>>,
    counters: Counters,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.borrow().is_empty()
    }

    /// Whether a blob exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.blobs.borrow().contains_key(&self.locate(key))
    }
}

impl ArtifactStore for MemoryStore {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        let blob = self.blobs.borrow().get(&self.locate(key)).cloned();
        if blob.is_some() {
            self.counters.load();
        }
        Ok(blob)
    }

    fn save(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .borrow_mut()
            .insert(self.locate(key), bytes.to_vec());
        self.counters.save();
        Ok(())
    }

    fn locate(&self, key: &CacheKey) -> String {
        format!("memory://{}/{}", key.image_stem, key.file_name())
    }

    fn stats(&self) -> StoreStats {
        self.counters.stats()
    }
}

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOrigin {
    Cache,
    Computed,
}

/// A value with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub origin: CacheOrigin,
    pub location: String,
}

impl<T> Cached<T> {
    /// Transform the value, keeping provenance.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            origin: self.origin,
            location: self.location,
        }
    }
}

/// Load-or-compute policy over an [`ArtifactStore`].
#[derive(Debug)]
pub struct ArtifactCache<S> {
    store: S,
}

impl<S: ArtifactStore> ArtifactCache<S> {
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Return the stored artifact for `key`, or compute and store it.
    ///
    /// A stored blob is used only when `force` is false, it decodes, and
    /// `validate` accepts it; otherwise it counts as a miss. Failing to
    /// save the fresh value is logged and does not fail the call.
    ///
    /// # Errors
    ///
    /// Propagates errors from `compute` and from reading the store.
    pub fn get_or_compute<T, V, C>(
        &self,
        key: &CacheKey,
        force: bool,
        validate: V,
        compute: C,
    ) -> Result<Cached<T>, StoreError>
    where
        T: Artifact,
        V: FnOnce(&T) -> bool,
        C: FnOnce() -> Result<T, StoreError>,
    {
        let location = self.store.locate(key);
        if !force {
            if let Some(value) = self.load_valid(key, &location, validate)? {
                tracing::info!(%location, "loaded cached artifact");
                return Ok(Cached {
                    value,
                    origin: CacheOrigin::Cache,
                    location,
                });
            }
        }

        tracing::info!(%key, force, "computing artifact");
        let value = compute()?;
        match value.encode().and_then(|bytes| self.store.save(key, &bytes)) {
            Ok(()) => tracing::debug!(%location, "cached artifact"),
            Err(err) => tracing::warn!(%location, %err, "failed to cache artifact"),
        }
        Ok(Cached {
            value,
            origin: CacheOrigin::Computed,
            location,
        })
    }

    fn load_valid<T: Artifact>(
        &self,
        key: &CacheKey,
        location: &str,
        validate: impl FnOnce(&T) -> bool,
    ) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.store.load(key)? else {
            tracing::debug!(%location, "cache miss");
            return Ok(None);
        };
        match T::decode(&bytes) {
            Ok(value) if validate(&value) => Ok(Some(value)),
            Ok(_) => {
                tracing::warn!(%location, "cached artifact failed validation; recomputing");
                Ok(None)
            }
            Err(err) => {
                tracing::warn!(%location, %err, "cached artifact is corrupt; recomputing");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use plexmap_pipeline::MaskImage;

    fn mask(v: u8) -> MaskImage {
        MaskImage::from_raw(2, 2, vec![v, 0, 0, v]).unwrap()
    }

    #[test]
    fn file_names_follow_layout() {
        assert_eq!(CacheKey::labels("img").file_name(), "img_rebuilt_labels.tif");
        assert_eq!(
            CacheKey::mask("img", "CD45_positive").file_name(),
            "img_CD45_positive_mask.tif"
        );
        assert_eq!(
            CacheKey::density("img", "tumor", 199.6).file_name(),
            "img_tumor_density_sigma200.tif"
        );
        assert_eq!(
            CacheKey::boundary("img", "tumor", 200.0, 95.0).file_name(),
            "img_tumor_density_boundary_sigma200_p95.json.gz"
        );
        assert_eq!(
            CacheKey::boundary("img", "tumor", 200.0, 97.5).file_name(),
            "img_tumor_density_boundary_sigma200_p97.5.json.gz"
        );
        assert_eq!(
            CacheKey::neighborhood("img", "a/b", 50.4).file_name(),
            "img_a%2Fb_neighborhood_yx_r50.json.gz"
        );
    }

    #[test]
    fn marker_encoding_is_injective() {
        let markers = ["CD8+", "CD8_", "CD8 ", "CD8%2B", "CD8/", "CD8\u{e9}", "CD8"];
        let names: std::collections::BTreeSet<_> = markers
            .iter()
            .map(|m| CacheKey::mask("img", m).file_name())
            .collect();
        assert_eq!(names.len(), markers.len());
        assert_eq!(encode_marker("CD8+"), "CD8%2B");
        assert_eq!(encode_marker("CD8%2B"), "CD8%252B");
        assert_eq!(encode_marker("CD8\u{e9}"), "CD8%C3%A9");
        assert_eq!(encode_marker("tumor_positive"), "tumor_positive");
    }

    #[test]
    fn second_call_is_a_cache_hit() {
        let cache = ArtifactCache::new(MemoryStore::new());
        let key = CacheKey::mask("img", "tumor");
        let mut computed = 0;

        let first = cache
            .get_or_compute(&key, false, |_| true, || {
                computed += 1;
                Ok(mask(1))
            })
            .unwrap();
        assert_eq!(first.origin, CacheOrigin::Computed);

        let second = cache
            .get_or_compute(&key, false, |_| true, || {
                computed += 1;
                Ok(mask(1))
            })
            .unwrap();
        assert_eq!(second.origin, CacheOrigin::Cache);
        assert_eq!(second.value, first.value);
        assert_eq!(computed, 1);
        assert_eq!(cache.store().stats(), StoreStats { loads: 1, saves: 1 });
    }

    #[test]
    fn force_recomputes_and_overwrites() {
        let cache = ArtifactCache::new(MemoryStore::new());
        let key = CacheKey::mask("img", "tumor");
        cache.get_or_compute(&key, false, |_| true, || Ok(mask(1))).unwrap();
        let forced = cache.get_or_compute(&key, true, |_| true, || Ok(mask(0))).unwrap();
        assert_eq!(forced.origin, CacheOrigin::Computed);
        let reread = cache
            .get_or_compute(&key, false, |_| true, || Ok(mask(1)))
            .unwrap();
        assert_eq!(reread.value, mask(0));
    }

    #[test]
    fn corrupt_blob_is_a_miss() {
        let store = MemoryStore::new();
        let key = CacheKey::mask("img", "tumor");
        store.save(&key, b"garbage").unwrap();
        let cache = ArtifactCache::new(store);
        let got = cache.get_or_compute(&key, false, |_| true, || Ok(mask(1))).unwrap();
        assert_eq!(got.origin, CacheOrigin::Computed);
        assert_eq!(got.value, mask(1));
    }

    #[test]
    fn rejected_blob_is_a_miss() {
        let cache = ArtifactCache::new(MemoryStore::new());
        let key = CacheKey::mask("img", "tumor");
        cache.get_or_compute(&key, false, |_| true, || Ok(mask(1))).unwrap();
        let got = cache
            .get_or_compute(&key, false, |m: &MaskImage| m.width() == 5, || Ok(mask(0)))
            .unwrap();
        assert_eq!(got.origin, CacheOrigin::Computed);
    }

    #[test]
    fn compute_errors_propagate() {
        let cache = ArtifactCache::new(MemoryStore::new());
        let key = CacheKey::labels("img");
        let err = cache
            .get_or_compute::<MaskImage, _, _>(&key, false, |_| true, || {
                Err(StoreError::InvalidRequest("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
        assert!(cache.store().is_empty());
    }

    #[test]
    fn fs_store_writes_under_image_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        let key = CacheKey::labels("slide1");
        assert_eq!(store.load(&key).unwrap(), None);
        store.save(&key, b"abc").unwrap();
        let path = dir.path().join("slide1").join("slide1_rebuilt_labels.tif");
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        assert_eq!(store.load(&key).unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.locate(&key), path.display().to_string());
        // No temporary files left behind.
        assert_eq!(std::fs::read_dir(dir.path().join("slide1")).unwrap().count(), 1);
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("nested").join("manifest.json");
        write_atomic(&target, b"first version").unwrap();
        write_atomic(&target, b"second").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("manifest.json")]);
    }

    #[test]
    fn failed_atomic_write_leaves_no_temporary() {
        let dir = tempfile::TempDir::new().unwrap();
        // Renaming a file over a directory fails.
        let target = dir.path().join("occupied");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();
        assert!(write_atomic(&target, b"data").is_err());
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("occupied")]);
    }

    #[test]
    fn save_failure_is_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        // A regular file where the image directory should go.
        std::fs::write(dir.path().join("img"), b"").unwrap();
        let cache = ArtifactCache::new(FsStore::new(dir.path()));
        let got = cache
            .get_or_compute(&CacheKey::mask("img", "tumor"), false, |_| true, || Ok(mask(1)))
            .unwrap();
        assert_eq!(got.origin, CacheOrigin::Computed);
        assert_eq!(cache.store().stats().saves, 0);
    }
}
