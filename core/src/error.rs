//! Error types at the engine seams.
//!
//! Storage plumbing uses `anyhow` with context; the coordinator and the
//! remote store boundary use these enums so callers can tell a fatal local
//! failure from a recoverable remote one.

use thiserror::Error;

/// Failures raised by a [`RemoteStore`](crate::remote::RemoteStore).
///
/// All of them are recoverable from the engine's point of view: the next
/// mutation or refresh tries again.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store is not configured")]
    NotConfigured,
    #[error("remote store rejected credentials: {0}")]
    Unauthorized(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("failed to decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether this failure is worth showing in the passive error banner.
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Self::NotConfigured)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local durability failed. Fatal to the calling operation.
    #[error("local cache error")]
    Cache(#[source] anyhow::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{0}")]
    Invalid(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
