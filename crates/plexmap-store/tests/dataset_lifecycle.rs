//! Integration test: ingest a dataset, derive artifacts through the
//! registry, and check cache reuse and source integrity checks.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::{Path, PathBuf};

use plexmap_pipeline::AnalysisConfig;
use plexmap_store::{
    ArtifactRequest, CacheOrigin, DatasetTarget, DerivedArtifact, IngestOptions, Registry,
    RequestedArtifact, StoreError, serve_request,
};
use tempfile::TempDir;

const TABLE: &str = "\
CellID,X_centroid,Y_centroid,MajorAxisLength,MinorAxisLength,Orientation,tumor_positive,CD45_positive
1,20,20,8,6,0.0,True,False
2,28,22,8,6,0.3,True,False
3,24,30,8,6,1.2,True,False
4,60,40,6,6,0.0,False,True
5,110,70,6,6,0.0,False,False
";

struct Sources {
    dir: TempDir,
    image: PathBuf,
    table: PathBuf,
}

fn sources() -> Sources {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("slide.png");
    let table = dir.path().join("cells.csv");
    image::GrayImage::new(128, 96).save(&image).unwrap();
    fs::write(&table, TABLE).unwrap();
    Sources { dir, image, table }
}

fn registry(src: &Sources) -> Registry {
    Registry::new(src.dir.path().join("data")).unwrap()
}

fn request(target: DatasetTarget, artifact: RequestedArtifact, force: bool) -> ArtifactRequest {
    ArtifactRequest {
        target,
        artifact,
        force_recompute: force,
    }
}

fn neighborhood(radius: f64) -> RequestedArtifact {
    RequestedArtifact::Neighborhood {
        marker: "tumor_positive".to_owned(),
        radius: Some(radius),
    }
}

#[test]
fn derived_artifacts_are_reused_across_workspaces() {
    let src = sources();
    let registry = registry(&src);
    let manifest = registry
        .ingest(&src.image, &src.table, IngestOptions::default())
        .unwrap();
    assert_eq!(manifest.dataset_id, "slide");

    let target = DatasetTarget::Id(manifest.dataset_id.clone());
    let req = request(target, neighborhood(50.0), false);

    let first = serve_request(&registry, &req, AnalysisConfig::default()).unwrap();
    let DerivedArtifact::Neighborhood(first) = first else {
        unreachable!("neighborhood request yields a neighborhood artifact");
    };
    assert_eq!(first.origin, CacheOrigin::Computed);
    assert!(Path::new(&first.location).is_file());
    assert!(
        first
            .location
            .ends_with("slide_tumor_positive_neighborhood_yx_r50.json.gz")
    );

    let second = serve_request(&registry, &req, AnalysisConfig::default()).unwrap();
    let DerivedArtifact::Neighborhood(second) = second else {
        unreachable!("neighborhood request yields a neighborhood artifact");
    };
    assert_eq!(second.origin, CacheOrigin::Cache);
    assert_eq!(second.value, first.value);

    let result = second.value.result().unwrap();
    assert_eq!(result.reference, vec![true, true, true, false, false]);
    assert_eq!(result.neighbor, vec![false, false, false, true, false]);
    assert_eq!(result.other, vec![false, false, false, false, true]);
    assert_eq!(result.classes[0].members, vec![false, false, false, true, false]);
    assert_eq!(result.segments.len(), 3);
}

#[test]
fn force_recompute_overwrites_cached_artifact() {
    let src = sources();
    let registry = registry(&src);
    registry
        .ingest(&src.image, &src.table, IngestOptions::default())
        .unwrap();
    let target = DatasetTarget::Id("slide".to_owned());
    let mask = RequestedArtifact::Mask {
        marker: "tumor_positive".to_owned(),
    };

    let cached = serve_request(
        &registry,
        &request(target.clone(), mask.clone(), false),
        AnalysisConfig::default(),
    )
    .unwrap();
    let forced = serve_request(
        &registry,
        &request(target, mask, true),
        AnalysisConfig::default(),
    )
    .unwrap();

    assert_eq!(cached.report().origin, CacheOrigin::Computed);
    assert_eq!(forced.report().origin, CacheOrigin::Computed);
    assert!(forced.report().detail["positive_pixels"].as_u64().unwrap() > 0);
    let (DerivedArtifact::Mask(cached), DerivedArtifact::Mask(forced)) = (cached, forced) else {
        unreachable!("mask requests yield mask artifacts");
    };
    assert_eq!(cached.value, forced.value);
    assert_eq!(cached.location, forced.location);
}

#[test]
fn modified_source_fails_integrity_check() {
    let src = sources();
    let registry = registry(&src);
    registry
        .ingest(&src.image, &src.table, IngestOptions::default())
        .unwrap();
    fs::write(&src.table, format!("{TABLE}6,1,1,4,4,0,False,False\n")).unwrap();

    let req = request(
        DatasetTarget::Id("slide".to_owned()),
        RequestedArtifact::Labels,
        false,
    );
    let err = serve_request(&registry, &req, AnalysisConfig::default()).unwrap_err();
    assert!(matches!(err, StoreError::Integrity { ref role, .. } if role == "table"));
}

#[test]
fn path_requests_write_to_legacy_root() {
    let src = sources();
    let registry = registry(&src);
    let req = request(
        DatasetTarget::Paths {
            image: src.image.clone(),
            table: src.table.clone(),
            output_root: None,
        },
        RequestedArtifact::Boundary {
            marker: "tumor_positive".to_owned(),
            sigma: Some(4.0),
            percentile: Some(50.0),
        },
        false,
    );
    let report = serve_request(&registry, &req, AnalysisConfig::default())
        .unwrap()
        .report();
    assert_eq!(report.kind, "boundary");
    assert!(Path::new(&report.location).starts_with(registry.root().join("legacy")));
    assert!(Path::new(&report.location).is_file());
}

#[test]
fn reingesting_an_id_with_other_sources_conflicts() {
    let src = sources();
    let registry = registry(&src);
    let options = || IngestOptions {
        dataset_id: Some("demo".to_owned()),
        ..IngestOptions::default()
    };
    let first = registry.ingest(&src.image, &src.table, options()).unwrap();
    assert_eq!(
        first.metadata["marker_columns"],
        serde_json::json!(["tumor_positive", "CD45_positive"])
    );

    let other = sources();
    let err = registry
        .ingest(&other.image, &other.table, options())
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(ref id) if id == "demo"));

    let again = registry.ingest(&src.image, &src.table, options()).unwrap();
    assert_eq!(again, first);
}

#[test]
fn markers_differing_only_in_punctuation_get_separate_artifacts() {
    let src = sources();
    fs::write(
        &src.table,
        "CellID,X_centroid,Y_centroid,MajorAxisLength,MinorAxisLength,Orientation,CD8+,CD8_\n\
         1,20,20,8,6,0.0,True,False\n\
         2,60,40,6,6,0.0,False,False\n",
    )
    .unwrap();
    let registry = registry(&src);
    registry
        .ingest(&src.image, &src.table, IngestOptions::default())
        .unwrap();
    let mask = |marker: &str| {
        let req = request(
            DatasetTarget::Id("slide".to_owned()),
            RequestedArtifact::Mask {
                marker: marker.to_owned(),
            },
            false,
        );
        serve_request(&registry, &req, AnalysisConfig::default())
            .unwrap()
            .report()
    };

    let plus = mask("CD8+");
    let underscore = mask("CD8_");
    assert_eq!(underscore.origin, CacheOrigin::Computed);
    assert_ne!(plus.location, underscore.location);
    assert!(plus.detail["positive_pixels"].as_u64().unwrap() > 0);
    assert_eq!(underscore.detail["positive_pixels"].as_u64().unwrap(), 0);
}

#[test]
fn unknown_dataset_is_not_found() {
    let src = sources();
    let registry = registry(&src);
    let req = request(
        DatasetTarget::Id("missing".to_owned()),
        RequestedArtifact::Labels,
        false,
    );
    assert!(matches!(
        serve_request(&registry, &req, AnalysisConfig::default()),
        Err(StoreError::NotFound { .. })
    ));
}
