//! Error type shared by the store, the console operations and the HTTP layer.

use axum::http::StatusCode;
use thiserror::Error;

use crate::model::IncidentStatus;

/// Errors raised by the CAD console.
///
/// Store failures are surfaced to the caller once and the operation is
/// abandoned. Nothing in the crate retries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("no session or session expired")]
    Unauthorized,

    #[error("role {role} may not {action}")]
    Forbidden { role: String, action: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("incident cannot move from {from} to {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },

    /// A stored document does not match the closed schema (for example an
    /// unknown status value).
    #[error("malformed document {collection}/{id}: {source}")]
    InvalidDocument {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(collection: &str, id: &str) -> Self {
        Error::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    /// HTTP status the API answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::InvalidDocument { .. }
            | Error::Config(_)
            | Error::Database(_)
            | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::not_found("incidents", "x").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(Error::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::InvalidTransition {
                from: IncidentStatus::Resolved,
                to: IncidentStatus::Pending,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::invalid("blank").status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_transition_message() {
        let err = Error::InvalidTransition {
            from: IncidentStatus::Resolved,
            to: IncidentStatus::Dispatched,
        };
        assert_eq!(
            err.to_string(),
            "incident cannot move from resolved to dispatched"
        );
    }
}
