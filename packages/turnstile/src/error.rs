//! Structured error types for the lifecycle engine.
//!
//! `EngineError` provides pattern-matchable domain errors instead of generic
//! `anyhow::Error`. Every variant carries enough context to produce a stable,
//! machine-qualified code and an HTTP-style status, so an API layer can
//! serialize errors directly without inspecting internals.
//!
//! # The Error Boundary Rule
//!
//! > Domain failures and infrastructure failures never share a variant.
//!
//! - `EngineError` is the externalized taxonomy (validation, guards, state)
//! - [`StorageError`](crate::storage::StorageError) is internal transport for
//!   the storage collaborator; it is recognized by type and normalized into
//!   [`EngineError::Storage`] exactly once, never double-wrapped.

use thiserror::Error;

/// Structured error type for engine operations.
///
/// Each variant includes the owning machine's name where one exists, so the
/// serialized code reads `order.not_found`, `order.guard_failed`, etc.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A read-by-id yielded nothing (or only a soft-deleted record).
    #[error("{machine}: record not found")]
    NotFound {
        /// Machine that performed the read.
        machine: String,
    },

    /// The named transition is not declared on the schema.
    #[error("{machine}: transition '{transition}' is not declared")]
    InvalidTransition {
        machine: String,
        transition: String,
    },

    /// The record's current state is not in the transition's `from` set.
    #[error("{machine}: cannot run '{transition}' from state '{state}'")]
    NoTransitionFromCurrentState {
        machine: String,
        transition: String,
        state: String,
    },

    /// A guard predicate returned false or raised a non-storage error.
    #[error("{machine}: {message}")]
    TransitionGuardFailed {
        machine: String,
        message: String,
    },

    /// A structural field error or a failed runtime/database/service rule.
    ///
    /// `field` is the prop's display alias, suitable for direct rendering.
    #[error("{machine}: validation failed on '{field}': {message}")]
    ValidationFailed {
        machine: String,
        field: String,
        message: String,
    },

    /// A nested edit targeted a record not owned by the inferred parent.
    #[error("{machine}: cannot edit a record owned by another parent")]
    EditSiblingResource {
        machine: String,
    },

    /// The persistence call was rejected.
    #[error("{machine}: save failed: {message}")]
    SaveFailed {
        machine: String,
        message: String,
    },

    /// A backend-specific storage error, re-raised with a normalized message.
    #[error("storage error: {message}")]
    Storage {
        message: String,
    },

    /// The remote service rejected our credentials.
    #[error("remote service rejected the request as unauthorized")]
    AuthFailed,

    /// A remote request failed for any reason other than auth/not-found.
    #[error("remote request failed (status {status:?}): {body}")]
    RequestError {
        /// HTTP status if a response was received at all.
        status: Option<u16>,
        /// Upstream error body, verbatim.
        body: String,
    },

    /// A filter parameter did not resolve to any output prop.
    #[error("invalid filter parameter '{param}'")]
    InvalidParam {
        param: String,
    },

    /// No machine is registered under the given resource name.
    #[error("unknown resource '{resource}'")]
    UnknownResource {
        resource: String,
    },

    /// A schema failed registration-time validation.
    #[error("{machine}: invalid schema: {message}")]
    InvalidSchema {
        machine: String,
        message: String,
    },
}

impl EngineError {
    /// Stable, machine-qualified code suitable for API error payloads.
    pub fn code(&self) -> String {
        match self {
            EngineError::NotFound { machine } => format!("{machine}.not_found"),
            EngineError::InvalidTransition { machine, .. } => {
                format!("{machine}.invalid_transition")
            }
            EngineError::NoTransitionFromCurrentState { machine, .. } => {
                format!("{machine}.no_transition_from_current_state")
            }
            EngineError::TransitionGuardFailed { machine, .. } => {
                format!("{machine}.guard_failed")
            }
            EngineError::ValidationFailed { machine, .. } => {
                format!("{machine}.validation_failed")
            }
            EngineError::EditSiblingResource { machine } => {
                format!("{machine}.edit_sibling_resource")
            }
            EngineError::SaveFailed { machine, .. } => format!("{machine}.save_failed"),
            EngineError::Storage { .. } => "storage.error".to_string(),
            EngineError::AuthFailed => "remote.unauthorized".to_string(),
            EngineError::RequestError { .. } => "remote.request_failed".to_string(),
            EngineError::InvalidParam { .. } => "query.invalid_param".to_string(),
            EngineError::UnknownResource { .. } => "engine.unknown_resource".to_string(),
            EngineError::InvalidSchema { machine, .. } => {
                format!("{machine}.invalid_schema")
            }
        }
    }

    /// HTTP-style status for direct serialization to an API response.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::NotFound { .. } => 404,
            EngineError::InvalidTransition { .. } => 400,
            EngineError::NoTransitionFromCurrentState { .. } => 409,
            EngineError::TransitionGuardFailed { .. } => 409,
            EngineError::ValidationFailed { .. } => 422,
            EngineError::EditSiblingResource { .. } => 403,
            EngineError::SaveFailed { .. } => 500,
            EngineError::Storage { .. } => 500,
            EngineError::AuthFailed => 401,
            EngineError::RequestError { .. } => 502,
            EngineError::InvalidParam { .. } => 400,
            EngineError::UnknownResource { .. } => 404,
            EngineError::InvalidSchema { .. } => 500,
        }
    }

    /// True if this error originated in the storage collaborator.
    ///
    /// Guard and save wrapping must not re-wrap an already-classified
    /// storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, EngineError::Storage { .. })
    }

    /// Shorthand for a validation failure.
    pub fn validation(
        machine: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EngineError::ValidationFailed {
            machine: machine.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_machine_qualified() {
        let err = EngineError::NotFound {
            machine: "order".into(),
        };
        assert_eq!(err.code(), "order.not_found");
        assert_eq!(err.status(), 404);

        let err = EngineError::TransitionGuardFailed {
            machine: "order".into(),
            message: "order is locked".into(),
        };
        assert_eq!(err.code(), "order.guard_failed");
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn test_validation_carries_field_alias() {
        let err = EngineError::validation("person", "Name", "is required");
        assert!(err.to_string().contains("Name"));
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn test_storage_recognition() {
        let err = EngineError::Storage {
            message: "malformed query".into(),
        };
        assert!(err.is_storage());
        assert!(!EngineError::AuthFailed.is_storage());
    }

    #[test]
    fn test_remote_statuses() {
        assert_eq!(EngineError::AuthFailed.status(), 401);
        let err = EngineError::RequestError {
            status: Some(500),
            body: "boom".into(),
        };
        assert_eq!(err.status(), 502);
        assert!(err.to_string().contains("boom"));
    }
}
