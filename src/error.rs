//! Error taxonomy for the storage layer.
//!
//! Every backend call ends in one of four buckets. `Connectivity` is always
//! recoverable (the facade falls back to the local store), `Validation` is
//! surfaced to the caller, `Backend` is a remote failure that is neither of
//! those, and `FatalLocal` means the last storage tier failed.

use thiserror::Error;

use crate::model::BackendKind;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Network failure, timeout or permission-denied against a backend.
    #[error("{backend} unreachable: {message}")]
    Connectivity {
        backend: BackendKind,
        message: String,
    },

    /// Malformed input, either caught locally or rejected by a backend
    /// (duplicate key, constraint violation).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Remote failure that is neither connectivity nor validation.
    #[error("{backend} error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Backend {
        backend: BackendKind,
        status: Option<u16>,
        message: String,
    },

    /// The local store itself failed (corrupt JSON, SQLite error, poisoned lock).
    #[error("local store failure: {0}")]
    FatalLocal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn connectivity(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Connectivity {
            backend,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalLocal(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::FatalLocal(format!("sqlite: {err}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::FatalLocal(format!("json: {err}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::FatalLocal(format!("lock poisoned: {err}"))
    }
}
