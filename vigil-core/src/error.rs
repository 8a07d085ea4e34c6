//! Error types for vigil core operations.
//!
//! Core errors are all "final" failures: they describe input that can never
//! become valid by retrying, so callers surface them instead of looping.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by domain validation and parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A required field is missing or empty.
    #[error("V001: {entity} field '{field}' is required")]
    MissingField {
        /// Entity kind being validated.
        entity: &'static str,
        /// Name of the offending field.
        field: &'static str,
    },

    /// A numeric field is outside its accepted range.
    #[error("V002: {entity} field '{field}' is out of range: {cause}")]
    OutOfRange {
        /// Entity kind being validated.
        entity: &'static str,
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        cause: String,
    },

    /// An entity with the same unique name already exists.
    #[error("V003: {entity} named '{name}' already exists")]
    Duplicate {
        /// Entity kind being validated.
        entity: &'static str,
        /// The duplicated name.
        name: String,
    },

    /// A timestamp string could not be parsed.
    #[error("V004: invalid timestamp '{input}': {cause}")]
    InvalidTimestamp {
        /// The rejected input.
        input: String,
        /// Parser error message.
        cause: String,
    },

    /// A time window is empty or inverted.
    #[error("V005: invalid window [{from_ms}, {to_ms})")]
    InvalidWindow {
        /// Window start (inclusive).
        from_ms: u64,
        /// Window end (exclusive).
        to_ms: u64,
    },
}

impl CoreError {
    /// Shorthand for a missing-field error.
    pub fn missing(entity: &'static str, field: &'static str) -> Self {
        Self::MissingField { entity, field }
    }

    /// Shorthand for an out-of-range error.
    pub fn out_of_range(entity: &'static str, field: &'static str, cause: impl Into<String>) -> Self {
        Self::OutOfRange {
            entity,
            field,
            cause: cause.into(),
        }
    }
}
