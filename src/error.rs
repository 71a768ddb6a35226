//! Custom error types for the automation core.
//!
//! This module defines the primary error type, `AutomationError`, for the
//! whole crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to report the failure classes the engines distinguish:
//!
//! - **`Validation`**: raised before any side effect (missing/bad script
//!   parameters, master channel not in group, ...). Carries every failing
//!   check, not just the first one.
//! - **`Duplicate` / `NotFound`**: registry errors keyed by entity kind and id.
//! - **`Busy`**: resource contention (starting something that is not idle,
//!   single-shot acquisition while continuous acquisition runs). Rejected
//!   synchronously with no state change.
//! - **`Script` / `Step`**: execution errors captured at the worker boundary
//!   and attached to the corresponding result object.
//! - **`Timeout`**: a collaborator did not complete within its deadline.
//! - **`Cancelled`**: not a failure; surfaced as a distinct outcome so
//!   callers can suppress failure reporting for in-flight work.
//!
//! Every variant carries enough text to identify which parameter, step, or
//! resource caused the failure; the GUI layer renders these messages
//! directly.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AutomationError>;

#[derive(Error, Debug)]
pub enum AutomationError {
    /// One or more validation checks failed before execution started.
    #[error("Parameter validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{kind} '{id}' already registered")]
    Duplicate { kind: &'static str, id: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Resource contention: the entity is not in a state that allows the
    /// requested operation.
    #[error("{0}")]
    Busy(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Step '{step_id}' failed: {message}")]
    Step { step_id: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AutomationError {
    /// Shorthand for a duplicate-registration error.
    pub fn duplicate(kind: &'static str, id: impl Into<String>) -> Self {
        AutomationError::Duplicate {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for a missing-entity error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        AutomationError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_failure() {
        let err = AutomationError::Validation(vec![
            "Required parameter 'channel' is not set".to_string(),
            "Parameter 'num_points' must be >= 2".to_string(),
        ]);
        let text = err.to_string();
        assert!(text.contains("'channel'"));
        assert!(text.contains("'num_points'"));
    }

    #[test]
    fn registry_error_display() {
        let err = AutomationError::duplicate("script", "sweep_1");
        assert_eq!(err.to_string(), "script 'sweep_1' already registered");

        let err = AutomationError::not_found("sequence", "seq_9");
        assert_eq!(err.to_string(), "sequence 'seq_9' not found");
    }
}
