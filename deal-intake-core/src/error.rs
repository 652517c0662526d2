//! Error types for the intake core.

use uuid::Uuid;

/// Errors surfaced by intake operations.
///
/// Per-field calculation problems never appear here; they are collected into
/// [`crate::CalculationResult::error`] so one bad formula cannot block a batch.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid value for {field_key}: {message}")]
    Validation { field_key: String, message: String },

    #[error("participant {0} has already completed their section")]
    AlreadyCompleted(Uuid),

    #[error("not allowed: {0}")]
    NotAllowed(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl IntakeError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(field_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field_key: field_key.into(),
            message: message.into(),
        }
    }

    /// Waiting and blocked states are modelled as data; only these are
    /// user-action failures that should render as a blocking toast.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::AlreadyCompleted(_) | Self::NotAllowed(_)
        )
    }
}

/// A string column did not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Why a single calculated field could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormulaError {
    #[error("Unknown formula format")]
    UnknownFormat,

    #[error("{field_key} is not a valid date (expected yyyy-MM-dd): {value}")]
    InvalidDate { field_key: String, value: String },

    #[error("{field_key} is not a number: {value}")]
    InvalidNumber { field_key: String, value: String },

    #[error("date arithmetic out of range for {field_key}")]
    OutOfRange { field_key: String },
}
