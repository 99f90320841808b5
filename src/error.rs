use thiserror::Error;

/// Failures surfaced by the record store.
///
/// Every multi-step mutation runs inside one transaction; by the time any of
/// these variants reaches the caller the transaction has been rolled back and
/// prior state is intact. The store never retries on its own.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Caller error: a required identity is missing or references a record
    /// that does not exist.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A patient with the same identifier already exists. The store is
    /// unchanged.
    #[error("a patient with identifier \"{0}\" already exists")]
    Conflict(String),

    /// A backup aggregate failed structural validation. Detected before any
    /// mutation, so existing data is untouched.
    #[error("invalid backup: {0}")]
    Integrity(String),

    /// Underlying persistence failure.
    #[error("storage failure: {0}")]
    Storage(#[from] diesel::result::Error),

    /// The storage engine could not be reached (pool exhausted, blocking
    /// worker gone).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
