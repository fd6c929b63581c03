//! Marker flag normalization.
//!
//! Observation tables encode marker positivity either as real booleans or
//! as loosely formatted strings (`"True"`, `" yes "`, `"1"`). Every
//! component decides positivity through [`MarkerValue::is_positive`] so the
//! rule lives in exactly one place.

use serde::{Deserialize, Serialize};

/// Strings accepted as positive, compared after trimming and lowercasing.
pub const TRUTHY: [&str; 5] = ["true", "t", "yes", "y", "1"];

/// One cell's value in a marker column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MarkerValue {
    Bool(bool),
    Text(String),
}

impl MarkerValue {
    /// Whether this value marks the cell as positive.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Text(s) => is_truthy(s),
        }
    }
}

impl From<bool> for MarkerValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for MarkerValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for MarkerValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Case-insensitive membership in the [`TRUTHY`] vocabulary.
#[must_use]
pub fn is_truthy(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    TRUTHY.contains(&normalized.as_str())
}

/// Positivity flags for a whole column.
#[must_use]
pub fn positive_flags(values: &[MarkerValue]) -> Vec<bool> {
    values.iter().map(MarkerValue::is_positive).collect()
}
