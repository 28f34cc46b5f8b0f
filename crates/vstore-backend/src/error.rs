use thiserror::Error;

use vstore_model::ObjectKind;

use crate::Operation;

/// Outcome of a failed fetch.
///
/// `Clone` so that one outcome can be handed to every waiter of a coalesced
/// request; variants carry messages rather than error sources for that reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Authoritative absence at the backend(s) that answered.
    #[error("{kind} {id} not found")]
    NotFound { kind: ObjectKind, id: String },

    /// Transient failure: network error, server error, or timeout.
    #[error("backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    /// The backend cannot serve this operation at all.
    #[error("{operation} not supported by {backend}")]
    Unsupported { backend: String, operation: Operation },

    /// Malformed or unexpected response.
    #[error("protocol error from {backend}: {reason}")]
    Protocol { backend: String, reason: String },
}

impl FetchError {
    pub fn not_found(kind: ObjectKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(backend: impl Into<String>, operation: Operation) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            operation,
        }
    }

    pub fn protocol(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::Protocol {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Only transient failures are worth retrying against the same backend.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Unavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}
