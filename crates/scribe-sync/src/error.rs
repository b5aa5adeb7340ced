//! Error types for scribe-sync

use thiserror::Error;

/// Result type alias using scribe-sync's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during sync operations
#[derive(Error, Debug)]
pub enum Error {
    /// Remote snapshot could not be retrieved; the pass was aborted before
    /// any local state was touched. Retryable.
    #[error("Remote fetch failed: {0}")]
    FetchFailed(String),

    /// A sync pass is already in flight for this engine
    #[error("A sync pass is already in progress")]
    SyncInProgress,

    /// No conflict registered under the given id
    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    /// The conflict was already resolved
    #[error("Conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// The conflict was superseded by a newer divergence since the caller
    /// read it; re-fetch the current conflict and retry
    #[error("Stale resolution for conflict {0}: the conflict was superseded by a newer divergence")]
    StaleResolution(String),

    /// Both sides edited free-text content; never auto-merged
    #[error("Note content changed on both sides; manual resolution required")]
    UnresolvableContent,

    /// A manual-value resolution was requested without a value
    #[error("Manual resolution requires a resolved value")]
    MissingManualValue,

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
