//! Reading source files: the per-cell CSV table and the image header.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use plexmap_pipeline::table::Column;
use plexmap_pipeline::{AnalysisError, ColumnNames, Dimensions, MarkerValue, ObservationTable};

use crate::error::StoreError;

/// Load an observation table from `.csv` or gzip-compressed `.csv.gz`.
///
/// Configured numeric columns are parsed as `f64` (empty cells become
/// NaN); every other column is kept as text marker values.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for a missing file, a CSV error for
/// malformed input, or [`AnalysisError::InvalidValue`] for an unparsable
/// numeric cell.
pub fn load_table(path: &Path, columns: &ColumnNames) -> Result<ObservationTable, StoreError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::not_found("table file", path),
        _ => e.into(),
    })?;
    let table = if is_gzipped(path) {
        read_table(GzDecoder::new(BufReader::new(file)), columns)?
    } else {
        read_table(BufReader::new(file), columns)?
    };
    tracing::debug!(
        path = %path.display(),
        rows = table.len(),
        "loaded observation table"
    );
    Ok(table)
}

/// Column names from the header row of a `.csv` or `.csv.gz` table,
/// without reading the records.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for a missing file or a CSV error for
/// an unreadable header.
pub fn table_columns(path: &Path) -> Result<Vec<String>, StoreError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::not_found("table file", path),
        _ => e.into(),
    })?;
    let reader: Box<dyn Read> = if is_gzipped(path) {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut rdr = csv::Reader::from_reader(reader);
    Ok(rdr.headers()?.iter().map(str::to_owned).collect())
}

fn is_gzipped(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Parse CSV text with a header row into an observation table.
///
/// # Errors
///
/// See [`load_table`].
pub fn read_table<R: Read>(reader: R, columns: &ColumnNames) -> Result<ObservationTable, StoreError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers: Vec<String> = rdr.headers()?.iter().map(str::to_owned).collect();
    let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for record in rdr.records() {
        let record = record?;
        for (column, value) in cells.iter_mut().zip(record.iter()) {
            column.push(value.to_owned());
        }
    }

    let numeric = columns.numeric();
    let mut table = ObservationTable::new();
    for (name, values) in headers.iter().zip(cells) {
        let column = if numeric.contains(&name.as_str()) {
            Column::Numeric(parse_numeric(name, &values)?)
        } else {
            Column::Markers(values.into_iter().map(MarkerValue::Text).collect())
        };
        table.insert(name, column)?;
    }
    Ok(table)
}

fn parse_numeric(column: &str, values: &[String]) -> Result<Vec<f64>, AnalysisError> {
    values
        .iter()
        .enumerate()
        .map(|(row, raw)| {
            let text = raw.trim();
            if text.is_empty() {
                return Ok(f64::NAN);
            }
            text.parse::<f64>().map_err(|_| AnalysisError::InvalidValue {
                column: column.to_owned(),
                row,
                value: raw.clone(),
            })
        })
        .collect()
}

/// Width and height of an image, read from its header only.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for a missing file, or an image error
/// when the format is unrecognized.
pub fn image_dimensions(path: &Path) -> Result<Dimensions, StoreError> {
    let reader = image::ImageReader::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::not_found("image file", path),
        _ => e.into(),
    })?;
    let (width, height) = reader.with_guessed_format()?.into_dimensions()?;
    Ok(Dimensions::new(width, height))
}

/// Image file name without its final extension; names artifact files.
#[must_use]
pub fn image_stem(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| "image".to_owned(), |s| s.to_string_lossy().into_owned())
}
