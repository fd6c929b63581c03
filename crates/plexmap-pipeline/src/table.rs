//! In-memory observation table: one row per cell, stored column by column.
//!
//! Numeric columns (identifiers, centroids, ellipse parameters) hold `f64`
//! values; every other column holds [`MarkerValue`]s. Typed accessors
//! convert between the two on demand, so a loader never has to guess which
//! columns are markers.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

use crate::marker::{MarkerValue, positive_flags};
use crate::types::{AnalysisError, CellId, ColumnNames, Point};

/// Storage for a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    Markers(Vec<MarkerValue>),
}

impl Column {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Markers(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of looking up a column by a loosely typed name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnMatch {
    Found(String),
    NotFound,
    Ambiguous(Vec<String>),
}

/// Per-cell observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationTable {
    rows: usize,
    order: Vec<String>,
    columns: BTreeMap<String, Column>,
}

impl ObservationTable {
    /// Create an empty table with no columns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column, replacing any existing column of the same name.
    ///
    /// The first column fixes the row count.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::ColumnLength`] if the column length differs
    /// from the table's row count.
    pub fn insert(&mut self, name: &str, column: Column) -> Result<(), AnalysisError> {
        let replacing = self.columns.contains_key(name);
        let sole_column = self.columns.is_empty() || (replacing && self.columns.len() == 1);
        if !sole_column && column.len() != self.rows {
            return Err(AnalysisError::ColumnLength {
                column: name.to_owned(),
                expected: self.rows,
                actual: column.len(),
            });
        }
        if sole_column {
            self.rows = column.len();
        }
        if !replacing {
            self.order.push(name.to_owned());
        }
        self.columns.insert(name.to_owned(), column);
        Ok(())
    }

    /// Builder form of [`insert`](Self::insert) for numeric columns.
    ///
    /// # Errors
    ///
    /// See [`insert`](Self::insert).
    pub fn with_numeric(mut self, name: &str, values: Vec<f64>) -> Result<Self, AnalysisError> {
        self.insert(name, Column::Numeric(values))?;
        Ok(self)
    }

    /// Builder form of [`insert`](Self::insert) for marker columns.
    ///
    /// # Errors
    ///
    /// See [`insert`](Self::insert).
    pub fn with_markers<V: Into<MarkerValue>>(
        mut self,
        name: &str,
        values: Vec<V>,
    ) -> Result<Self, AnalysisError> {
        let values = values.into_iter().map(Into::into).collect();
        self.insert(name, Column::Markers(values))?;
        Ok(self)
    }

    /// Number of rows (cells).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Ensure every named column exists.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::MissingColumns`] listing every absent name.
    pub fn require(&self, names: &[&str]) -> Result<(), AnalysisError> {
        let missing: Vec<String> = names
            .iter()
            .filter(|name| !self.has_column(name))
            .map(|name| (*name).to_owned())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AnalysisError::MissingColumns(missing))
        }
    }

    fn column(&self, name: &str) -> Result<&Column, AnalysisError> {
        self.columns
            .get(name)
            .ok_or_else(|| AnalysisError::MissingColumns(vec![name.to_owned()]))
    }

    /// A column as numbers. Marker columns are parsed (`Bool` maps to 1/0).
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::MissingColumns`] if absent, or
    /// [`AnalysisError::InvalidValue`] for text that is not a number.
    pub fn numeric(&self, name: &str) -> Result<Cow<'_, [f64]>, AnalysisError> {
        match self.column(name)? {
            Column::Numeric(values) => Ok(Cow::Borrowed(values)),
            Column::Markers(values) => values
                .iter()
                .enumerate()
                .map(|(row, value)| match value {
                    MarkerValue::Bool(b) => Ok(f64::from(u8::from(*b))),
                    MarkerValue::Text(text) => {
                        text.trim()
                            .parse::<f64>()
                            .map_err(|_| AnalysisError::InvalidValue {
                                column: name.to_owned(),
                                row,
                                value: text.clone(),
                            })
                    }
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Cow::Owned),
        }
    }

    /// A column as marker values. Numbers are rendered to text first.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::MissingColumns`] if absent.
    pub fn markers(&self, name: &str) -> Result<Cow<'_, [MarkerValue]>, AnalysisError> {
        match self.column(name)? {
            Column::Markers(values) => Ok(Cow::Borrowed(values)),
            Column::Numeric(values) => Ok(Cow::Owned(
                values
                    .iter()
                    .map(|v| MarkerValue::Text(v.to_string()))
                    .collect(),
            )),
        }
    }

    /// Per-row positivity of a marker column.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::MissingColumns`] if absent.
    pub fn positive(&self, name: &str) -> Result<Vec<bool>, AnalysisError> {
        Ok(positive_flags(&self.markers(name)?))
    }

    /// Cell identifiers, validated as unique positive integers. Zero is the
    /// background label and is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::MissingColumns`],
    /// [`AnalysisError::InvalidValue`] for zero, non-integral or
    /// out-of-range identifiers, or [`AnalysisError::DuplicateCellId`].
    pub fn cell_ids(&self, columns: &ColumnNames) -> Result<Vec<CellId>, AnalysisError> {
        let raw = self.numeric(&columns.cell_id)?;
        let mut seen = HashSet::with_capacity(raw.len());
        raw.iter()
            .enumerate()
            .map(|(row, &value)| {
                let id = to_cell_id(value).ok_or_else(|| AnalysisError::InvalidValue {
                    column: columns.cell_id.clone(),
                    row,
                    value: value.to_string(),
                })?;
                if !seen.insert(id) {
                    return Err(AnalysisError::DuplicateCellId(id));
                }
                Ok(id)
            })
            .collect()
    }

    /// Cell centroids in image pixel space.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::MissingColumns`] naming every absent
    /// coordinate column, or [`AnalysisError::InvalidValue`] for
    /// unparseable values.
    pub fn centroids(&self, columns: &ColumnNames) -> Result<Vec<Point>, AnalysisError> {
        self.require(&[columns.x_centroid.as_str(), columns.y_centroid.as_str()])?;
        let xs = self.numeric(&columns.x_centroid)?;
        let ys = self.numeric(&columns.y_centroid)?;
        Ok(xs
            .iter()
            .zip(ys.iter())
            .map(|(&x, &y)| Point::new(x, y))
            .collect())
    }

    /// Look up a column by case-insensitive exact name, falling back to a
    /// unique case-insensitive substring match.
    #[must_use]
    pub fn resolve_column(&self, query: &str) -> ColumnMatch {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return ColumnMatch::NotFound;
        }
        if let Some(exact) = self.order.iter().find(|name| name.to_lowercase() == needle) {
            return ColumnMatch::Found(exact.clone());
        }
        let mut candidates: Vec<String> = self
            .order
            .iter()
            .filter(|name| name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        match candidates.len() {
            0 => ColumnMatch::NotFound,
            1 => ColumnMatch::Found(candidates.remove(0)),
            _ => ColumnMatch::Ambiguous(candidates),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_cell_id(value: f64) -> Option<CellId> {
    let in_range = value.is_finite() && value >= 1.0 && value <= f64::from(CellId::MAX);
    (in_range && value.fract() == 0.0).then_some(value as CellId)
}
