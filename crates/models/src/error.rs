//! Construction-time errors for model configs.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Raised when a model config cannot produce a valid network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be positive")]
    Zero { field: &'static str },
    #[error("{field} = {value} must be a multiple of {divisor}")]
    Indivisible {
        field: &'static str,
        value: usize,
        divisor: usize,
    },
    #[error("unknown {kind} variant `{value}`")]
    UnknownVariant { kind: &'static str, value: String },
}

pub(crate) fn positive(field: &'static str, value: usize) -> Result<usize> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(value)
    }
}

pub(crate) fn multiple_of(field: &'static str, value: usize, divisor: usize) -> Result<usize> {
    positive(field, value)?;
    if value % divisor != 0 {
        return Err(ConfigError::Indivisible {
            field,
            value,
            divisor,
        });
    }
    Ok(value)
}
