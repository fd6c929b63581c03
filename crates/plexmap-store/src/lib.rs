//! plexmap-store: Dataset registry, source loading and the derived-artifact
//! cache.
//!
//! Wraps the sans-IO `plexmap-pipeline` with everything that touches the
//! filesystem: resolving datasets to their image, table and output
//! directory, reading CSV tables and image headers, and persisting derived
//! artifacts so repeated requests are loads instead of recomputations.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod source;
pub mod workspace;

pub use cache::{
    ArtifactCache, ArtifactKind, ArtifactStore, CacheKey, CacheOrigin, Cached, FsStore,
    MemoryStore, StoreStats,
};
pub use codec::Artifact;
pub use error::StoreError;
pub use registry::{ClearReport, DatasetContext, IngestOptions, Manifest, Registry};
pub use source::{image_dimensions, load_table};
pub use workspace::{
    ArtifactReport, ArtifactRequest, DatasetTarget, DerivedArtifact, RequestedArtifact, Workspace,
    serve_request,
};
