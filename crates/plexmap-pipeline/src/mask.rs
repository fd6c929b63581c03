//! Marker masks: reduce a label image to the footprints of positive cells.

use std::collections::HashSet;

use image::Luma;

use crate::table::ObservationTable;
use crate::types::{AnalysisError, CellId, ColumnNames, LabelImage, MaskImage};

/// Identifiers of every cell whose marker value is positive.
///
/// # Errors
///
/// Returns [`AnalysisError::MissingColumns`] if the identifier or marker
/// column is absent, or an identifier validation error.
pub fn positive_cell_ids(
    table: &ObservationTable,
    marker_column: &str,
    columns: &ColumnNames,
) -> Result<HashSet<CellId>, AnalysisError> {
    table.require(&[columns.cell_id.as_str(), marker_column])?;
    let ids = table.cell_ids(columns)?;
    let flags = table.positive(marker_column)?;
    Ok(ids
        .into_iter()
        .zip(flags)
        .filter_map(|(id, positive)| positive.then_some(id))
        .collect())
}

/// Binary mask: `1` where the pixel's label belongs to `positive`.
///
/// Background (`0`) is never part of the mask.
#[must_use = "returns the mask image"]
pub fn mask_from_labels(labels: &LabelImage, positive: &HashSet<CellId>) -> MaskImage {
    MaskImage::from_fn(labels.width(), labels.height(), |x, y| {
        let id = labels.get_pixel(x, y).0[0];
        Luma([u8::from(id != 0 && positive.contains(&id))])
    })
}

/// Build the mask of `marker_column`-positive cells.
///
/// # Errors
///
/// See [`positive_cell_ids`].
pub fn build_mask(
    labels: &LabelImage,
    table: &ObservationTable,
    marker_column: &str,
    columns: &ColumnNames,
) -> Result<MaskImage, AnalysisError> {
    let positive = positive_cell_ids(table, marker_column, columns)?;
    Ok(mask_from_labels(labels, &positive))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn labels() -> LabelImage {
        // 4x2 raster:
        // 0 1 1 2
        // 3 3 0 2
        LabelImage::from_raw(4, 2, vec![0, 1, 1, 2, 3, 3, 0, 2]).unwrap()
    }

    fn table() -> ObservationTable {
        ObservationTable::new()
            .with_numeric("CellID", vec![1.0, 2.0, 3.0])
            .unwrap()
            .with_markers("tumor", vec!["yes", "no", "T"])
            .unwrap()
    }

    #[test]
    fn mask_marks_positive_footprints() {
        let mask = build_mask(&labels(), &table(), "tumor", &ColumnNames::default()).unwrap();
        assert_eq!(mask.as_raw(), &vec![0, 1, 1, 0, 1, 1, 0, 0]);
    }

    #[test]
    fn mask_has_label_dimensions() {
        let mask = build_mask(&labels(), &table(), "tumor", &ColumnNames::default()).unwrap();
        assert_eq!((mask.width(), mask.height()), (4, 2));
    }

    #[test]
    fn no_positive_cells_gives_empty_mask() {
        let t = ObservationTable::new()
            .with_numeric("CellID", vec![1.0, 2.0, 3.0])
            .unwrap()
            .with_markers("tumor", vec![false, false, false])
            .unwrap();
        let mask = build_mask(&labels(), &t, "tumor", &ColumnNames::default()).unwrap();
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn positive_ids_not_in_labels_are_ignored() {
        let positive: HashSet<CellId> = [2, 99].into_iter().collect();
        let mask = mask_from_labels(&labels(), &positive);
        assert_eq!(mask.as_raw(), &vec![0, 0, 0, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn missing_marker_column_is_an_error() {
        let err = build_mask(&labels(), &table(), "CD45", &ColumnNames::default()).unwrap_err();
        assert_eq!(err, AnalysisError::MissingColumns(vec!["CD45".into()]));
    }
}
