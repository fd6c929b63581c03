//! plexmap: command-line access to datasets and derived artifacts.
//!
//! Registers image/table pairs as datasets and serves derived artifacts
//! (label images, marker masks, densities, boundaries, neighborhoods)
//! through the on-disk cache. Human-readable output by default; `--json`
//! prints one JSON document per command on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! plexmap ingest --image slide.tif --table cells.csv
//! plexmap density --dataset slide --marker tumor --sigma 150
//! plexmap neighborhood --image slide.tif --table cells.csv --marker tumor --json
//! plexmap derive '{"target":{"id":"slide"},"artifact":{"kind":"labels"}}'
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use plexmap_pipeline::{AnalysisConfig, AnalysisError};
use plexmap_store::{
    ArtifactRequest, CacheOrigin, DatasetContext, DerivedArtifact, FsStore, IngestOptions,
    Registry, StoreError, Workspace, serve_request,
};
use serde::Serialize;
use serde_json::{Map, Value};

/// Explore segmented multiplex images through cached derived artifacts.
#[derive(Parser)]
#[command(name = "plexmap", version)]
struct Cli {
    /// Data root holding dataset manifests (defaults to
    /// `$PLEXMAP_DATA_ROOT`, else `~/PLEXMAP_DATA`).
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Full analysis config as a JSON string.
    ///
    /// Fields left out keep their defaults. Per-command flags such as
    /// `--sigma` still override it.
    #[arg(long, global = true)]
    config_json: Option<String>,

    /// Print results as JSON instead of a human-readable report.
    #[arg(long, global = true)]
    json: bool,

    /// Raise log verbosity (`-v` debug, `-vv` trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register an image and its per-cell table as a dataset.
    Ingest {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        table: PathBuf,
        /// Dataset id; derived from the image file name when omitted.
        #[arg(long)]
        id: Option<String>,
        /// Copy the sources into the dataset's `raw/` directory.
        #[arg(long)]
        copy: bool,
        /// Extra manifest metadata as `KEY=VALUE` (value parsed as JSON
        /// when possible).
        #[arg(long = "meta", value_parser = parse_meta)]
        metadata: Vec<(String, Value)>,
    },
    /// List registered dataset ids.
    List,
    /// Show the resolved paths of a dataset.
    Paths {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Delete a dataset's cached artifacts.
    Clear {
        #[arg(long)]
        dataset: String,
        /// Also delete the copies under `raw/` made by `ingest --copy`.
        /// Sources registered in place are never deleted.
        #[arg(long)]
        delete_raw: bool,
    },
    /// Label image rebuilt from the cell ellipses.
    Labels {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        force: bool,
    },
    /// Masks of marker-positive cells; absent markers are skipped.
    Mask {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long = "marker", required = true)]
        markers: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    /// Smoothed density of marker-positive cells.
    Density {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        marker: String,
        #[arg(long)]
        sigma: Option<f64>,
        #[arg(long)]
        force: bool,
    },
    /// Iso-contour boundary of a marker density.
    Boundary {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        marker: String,
        #[arg(long)]
        sigma: Option<f64>,
        #[arg(long)]
        percentile: Option<f64>,
        #[arg(long)]
        force: bool,
    },
    /// Cells within a radius of a reference population.
    Neighborhood {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        marker: String,
        #[arg(long)]
        radius: Option<f64>,
        #[arg(long)]
        force: bool,
    },
    /// View box around the densest point of a marker density.
    DenseRegion {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        marker: String,
        #[arg(long)]
        sigma: Option<f64>,
        #[arg(long)]
        margin: Option<u32>,
        #[arg(long)]
        force: bool,
    },
    /// Serve an `ArtifactRequest` given as JSON (or `@path` to a JSON file).
    Derive { request: String },
}

/// Either a dataset id or explicit source paths.
#[derive(Args)]
struct TargetArgs {
    #[arg(long, conflicts_with_all = ["image", "table", "output_root"])]
    dataset: Option<String>,
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long)]
    table: Option<PathBuf>,
    #[arg(long)]
    output_root: Option<PathBuf>,
}

impl TargetArgs {
    fn resolve(&self, registry: &Registry) -> Result<DatasetContext, StoreError> {
        registry.resolve(
            self.dataset.as_deref(),
            self.image.as_deref(),
            self.table.as_deref(),
            self.output_root.as_deref(),
        )
    }
}

fn parse_meta(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

/// Build the [`AnalysisConfig`] from `--config-json`, or the default.
fn config_from_cli(cli: &Cli) -> Result<AnalysisConfig, StoreError> {
    let config: AnalysisConfig = match cli.config_json {
        Some(ref json) => serde_json::from_str(json)
            .map_err(|e| StoreError::InvalidRequest(format!("--config-json: {e}")))?,
        None => AnalysisConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn read_request(raw: &str) -> Result<ArtifactRequest, StoreError> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => raw.to_owned(),
    };
    serde_json::from_str(&text).map_err(|e| StoreError::InvalidRequest(format!("request: {e}")))
}

/// Map user-typed marker names to table columns. Names matching nothing
/// pass through unchanged so the mask command can skip them.
fn resolve_markers(
    workspace: &Workspace<FsStore>,
    queries: &[String],
) -> Result<Vec<String>, StoreError> {
    queries
        .iter()
        .map(|q| match workspace.resolve_marker(q) {
            Err(StoreError::Analysis(AnalysisError::MissingColumns(_))) => Ok(q.clone()),
            other => other,
        })
        .collect()
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<(), StoreError> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

const fn origin_label(origin: CacheOrigin) -> &'static str {
    match origin {
        CacheOrigin::Cache => "cached",
        CacheOrigin::Computed => "computed",
    }
}

fn emit_artifacts(json: bool, artifacts: &[DerivedArtifact]) -> Result<(), StoreError> {
    let reports: Vec<_> = artifacts.iter().map(DerivedArtifact::report).collect();
    emit(json, &reports, || {
        reports
            .iter()
            .map(|r| {
                format!(
                    "{} ({}): {}\n  {}",
                    r.kind,
                    origin_label(r.origin),
                    r.location,
                    r.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

#[allow(clippy::too_many_lines)]
fn run(cli: &Cli) -> Result<(), StoreError> {
    let config = config_from_cli(cli)?;
    let registry = match cli.data_root {
        Some(ref root) => Registry::new(root)?,
        None => Registry::from_env()?,
    };
    tracing::debug!(root = %registry.root().display(), "data root");
    let open = |target: &TargetArgs| -> Result<Workspace<FsStore>, StoreError> {
        Workspace::open(&target.resolve(&registry)?, config.clone())
    };

    match &cli.command {
        Command::Ingest {
            image,
            table,
            id,
            copy,
            metadata,
        } => {
            let manifest = registry.ingest(
                image,
                table,
                IngestOptions {
                    dataset_id: id.clone(),
                    copy_files: *copy,
                    columns: config.columns.clone(),
                    metadata: metadata.iter().cloned().collect::<Map<_, _>>(),
                },
            )?;
            emit(cli.json, &manifest, || {
                format!(
                    "dataset '{}' -> {}",
                    manifest.dataset_id,
                    manifest.output_root.display()
                )
            })
        }
        Command::List => {
            let mut ids: Vec<String> = registry.list_datasets()?.collect();
            ids.sort();
            emit(cli.json, &ids, || ids.join("\n"))
        }
        Command::Paths { target } => {
            let context = target.resolve(&registry)?;
            emit(cli.json, &context, || {
                format!(
                    "image:       {}\ntable:       {}\noutput root: {}",
                    context.image_path.display(),
                    context.table_path.display(),
                    context.output_root.display()
                )
            })
        }
        Command::Clear {
            dataset,
            delete_raw,
        } => {
            let report = registry.clear_cache(dataset, *delete_raw)?;
            emit(cli.json, &report, || {
                format!(
                    "cleared '{dataset}': processed={}, raw files deleted={}",
                    report.processed,
                    report.raw_files_deleted.len()
                )
            })
        }
        Command::Labels { target, force } => {
            let ws = open(target)?;
            emit_artifacts(cli.json, &[DerivedArtifact::Labels(ws.labels(*force)?)])
        }
        Command::Mask {
            target,
            markers,
            force,
        } => {
            let ws = open(target)?;
            let markers = resolve_markers(&ws, markers)?;
            let names: Vec<&str> = markers.iter().map(String::as_str).collect();
            let masks: Vec<DerivedArtifact> = ws
                .marker_masks(&names, *force)?
                .into_iter()
                .map(|(_, mask)| DerivedArtifact::Mask(mask))
                .collect();
            emit_artifacts(cli.json, &masks)
        }
        Command::Density {
            target,
            marker,
            sigma,
            force,
        } => {
            let ws = open(target)?;
            let marker = ws.resolve_marker(marker)?;
            let sigma = sigma.unwrap_or(config.density_sigma);
            emit_artifacts(
                cli.json,
                &[DerivedArtifact::Density(ws.density(&marker, sigma, *force)?)],
            )
        }
        Command::Boundary {
            target,
            marker,
            sigma,
            percentile,
            force,
        } => {
            let ws = open(target)?;
            let marker = ws.resolve_marker(marker)?;
            let paths = ws.boundary(
                &marker,
                sigma.unwrap_or(config.density_sigma),
                percentile.unwrap_or(config.boundary_percentile),
                *force,
            )?;
            emit_artifacts(cli.json, &[DerivedArtifact::Boundary(paths)])
        }
        Command::Neighborhood {
            target,
            marker,
            radius,
            force,
        } => {
            let ws = open(target)?;
            let marker = ws.resolve_marker(marker)?;
            let outcome =
                ws.neighborhood(&marker, radius.unwrap_or(config.neighborhood_radius), *force)?;
            if !cli.json {
                eprintln!("{}", outcome.value.describe());
            }
            emit_artifacts(cli.json, &[DerivedArtifact::Neighborhood(outcome)])
        }
        Command::DenseRegion {
            target,
            marker,
            sigma,
            margin,
            force,
        } => {
            let ws = open(target)?;
            let marker = ws.resolve_marker(marker)?;
            let region = ws.dense_region(
                &marker,
                sigma.unwrap_or(config.density_sigma),
                *margin,
                *force,
            )?;
            emit_artifacts(cli.json, &[DerivedArtifact::DenseRegion(region)])
        }
        Command::Derive { request } => {
            let request = read_request(request)?;
            let derived = serve_request(&registry, &request, config.clone())?;
            emit_artifacts(cli.json, &[derived])
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::setup_logging(cli.verbose) {
        eprintln!("Error initializing logging: {e}");
        return ExitCode::FAILURE;
    }
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
