//! Error taxonomy for the sync engine.
//!
//! Two classes matter to callers: client errors (malformed requests,
//! unknown mutators, bad cookies) must be rejected without touching the
//! store, and storage errors abort the whole operation so a retry is
//! always safe.

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by push and pull.
#[derive(Debug)]
pub enum SyncError {
    /// Malformed request payload — reject with 4xx, store untouched
    Decode(String),
    /// Mutation names a mutator that was never registered
    UnknownMutator(String),
    /// Store failure — whole operation aborted, safe to retry
    Storage(StoreError),
    /// Wire protocol failure (bad cookie, bad frame)
    Protocol(ProtocolError),
}

impl SyncError {
    /// True for errors caused by the request itself rather than the server.
    ///
    /// Client errors map to 4xx and are not retryable as-is; everything
    /// else maps to 5xx and is safe to retry because failed operations
    /// never commit partially.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::Decode(_) | SyncError::UnknownMutator(_) | SyncError::Protocol(_)
        )
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Decode(msg) => write!(f, "Decode error: {msg}"),
            SyncError::UnknownMutator(name) => write!(f, "Unknown mutator: {name:?}"),
            SyncError::Storage(e) => write!(f, "Storage error: {e}"),
            SyncError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Storage(e) => Some(e),
            SyncError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(SyncError::Decode("bad".into()).is_client_error());
        assert!(SyncError::UnknownMutator("nope".into()).is_client_error());
        assert!(SyncError::Protocol(ProtocolError::InvalidCookie("x".into())).is_client_error());
        assert!(!SyncError::Storage(StoreError::DatabaseError("io".into())).is_client_error());
    }

    #[test]
    fn test_display_includes_cause() {
        let err = SyncError::UnknownMutator("resize".into());
        assert!(err.to_string().contains("resize"));

        let err = SyncError::Storage(StoreError::DatabaseError("write failed".into()));
        assert!(err.to_string().contains("write failed"));
    }

    #[test]
    fn test_from_serde_json_is_decode() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SyncError = parse_err.into();
        assert!(matches!(err, SyncError::Decode(_)));
        assert!(err.is_client_error());
    }
}
