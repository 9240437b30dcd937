//! Config values that pick a variant either by position or by name.

use serde::Deserialize;

/// `residual = 2` and `residual = "inverted_residual"` select the same variant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    Index(usize),
    Name(String),
}
