use std::time::Duration;
use thiserror::Error;

/// Boxed error used to carry backend-specific failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`PolicyStore`](crate::PolicyStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing medium could not be reached.
    #[error("backing store unreachable: {0}")]
    Unavailable(#[source] BoxError),
    /// The call did not finish before its deadline.
    #[error("store call exceeded its deadline ({0:?} budget)")]
    DeadlineExceeded(Duration),
    /// The store detected a concurrent write.
    #[error("concurrent write detected: {0}")]
    WriteConflict(String),
}

impl StoreError {
    /// Wraps any error as [`StoreError::Unavailable`].
    pub fn unavailable(error: impl Into<BoxError>) -> Self {
        Self::Unavailable(error.into())
    }
}

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The policy store is unreachable or timed out. Retryable.
    #[error("policy store unavailable")]
    StoreUnavailable(#[source] StoreError),
    /// The policy store rejected a write because of a concurrent writer.
    /// Retry after reloading.
    #[error("policy store write conflict")]
    StoreWriteConflict(#[source] StoreError),
    /// Malformed identifier or tuple. Not retryable.
    #[error("invalid tuple: {0}")]
    InvalidTuple(String),
}

impl Error {
    /// Returns whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::StoreWriteConflict(_))
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::WriteConflict(_) => Self::StoreWriteConflict(error),
            StoreError::Unavailable(_) | StoreError::DeadlineExceeded(_) => {
                Self::StoreUnavailable(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn deadline_should_map_to_unavailable() {
        let err = Error::from(StoreError::DeadlineExceeded(Duration::from_millis(5)));
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(err.is_retryable());
        assert!(err.source().is_some());
    }

    #[test]
    fn write_conflict_should_map_to_conflict() {
        let err = Error::from(StoreError::WriteConflict("row changed".into()));
        assert!(matches!(err, Error::StoreWriteConflict(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_tuple_should_not_be_retryable() {
        assert!(!Error::InvalidTuple("subject id must not be empty".into()).is_retryable());
    }
}
