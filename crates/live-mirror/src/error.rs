use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ValidationError / ValidationErrors
// ---------------------------------------------------------------------------

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub expected: String,
    pub received: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"Validation failed at "{}": expected {}, received {}"#,
            self.path, self.expected, self.received
        )
    }
}

impl std::error::Error for ValidationError {}

/// A collection of one or more `ValidationError`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn single(
        path: impl Into<String>,
        expected: impl Into<String>,
        received: impl Into<String>,
    ) -> Self {
        Self(vec![ValidationError {
            path: path.into(),
            expected: expected.into(),
            received: received.into(),
        }])
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed:")?;
        for e in &self.0 {
            write!(f, "\n  - {}: expected {}, received {}", e.path, e.expected, e.received)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ---------------------------------------------------------------------------
// StoreError: failures reported by the remote store
// ---------------------------------------------------------------------------

/// Classification of remote store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    /// Transient: network or backend unavailable.
    Unavailable,
    /// The write conflicted or the batch was rolled back.
    Aborted,
    InvalidArgument,
    Cancelled,
    Internal,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::PermissionDenied => "permission-denied",
            Self::Unavailable => "unavailable",
            Self::Aborted => "aborted",
            Self::InvalidArgument => "invalid-argument",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`RemoteStore`](crate::store::RemoteStore) primitive.
///
/// `Clone` so a single feed failure can be handed to every observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(StoreErrorKind::NotFound, format!("no document at \"{path}\""))
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unavailable, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Aborted, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::InvalidArgument, message)
    }
}

// ---------------------------------------------------------------------------
// Batched save failures
// ---------------------------------------------------------------------------

/// Remote write kinds, used to label persistence failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Add,
    Update,
    Delete,
    Commit,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Commit => "batch commit",
        };
        f.write_str(name)
    }
}

/// One atomic batch that failed to commit. Its documents remain dirty.
#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub ids: Vec<String>,
    pub error: StoreError,
}

#[derive(Debug, Clone, Error)]
#[error(
    "Batched save failed: {failed} of {total_batches} batches rejected \
     ({committed_batches} committed); first error: {first}",
    failed = .failures.len(),
    first = .failures.first().map(|f| f.error.to_string()).unwrap_or_default()
)]
pub struct BatchSaveError {
    pub total_batches: usize,
    pub committed_batches: usize,
    pub failures: Vec<FailedBatch>,
}

impl BatchSaveError {
    /// Ids of every document that is still dirty because its batch failed.
    pub fn dirty_ids(&self) -> Vec<&str> {
        self.failures
            .iter()
            .flat_map(|f| f.ids.iter().map(String::as_str))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MirrorError: top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Invalid record for \"{path}\": {errors}")]
    Validation {
        path: String,
        #[source]
        errors: ValidationErrors,
    },

    #[error("Remote {op} failed for \"{path}\": {source}")]
    Persistence {
        op: WriteOp,
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("Change feed for \"{path}\" failed: {source}")]
    Subscription {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("Subscription to \"{path}\" was cancelled before its first snapshot")]
    SubscriptionCancelled { path: String },

    #[error(transparent)]
    BatchSave(#[from] BatchSaveError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl MirrorError {
    pub(crate) fn validation(path: &str, errors: ValidationErrors) -> Self {
        Self::Validation {
            path: path.to_string(),
            errors,
        }
    }

    pub(crate) fn persistence(op: WriteOp, path: &str, source: StoreError) -> Self {
        Self::Persistence {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// The underlying store error, when the failure came from the remote store.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Persistence { source, .. } | Self::Subscription { source, .. } => Some(source),
            Self::BatchSave(e) => e.failures.first().map(|f| &f.error),
            _ => None,
        }
    }
}

/// Convenience alias; the default error type is `MirrorError`.
pub type Result<T, E = MirrorError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
