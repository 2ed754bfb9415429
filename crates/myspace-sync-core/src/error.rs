//! Error types for the MySpace sync engine

use thiserror::Error;

/// Main error type for sync engine operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// General I/O error (identity file, data directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted identity file exists but cannot be used
    ///
    /// Never overwritten automatically; the operator has to resolve it.
    #[error("Identity file is corrupt: {0}")]
    IdentityCorrupt(String),

    /// A device assertion failed verification during the handshake
    #[error("Device assertion invalid: {0}")]
    AssertionInvalid(String),

    /// Per-message signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// A record with this key is already present (live or tombstoned)
    #[error("Record already exists: {table}/{id}")]
    AlreadyExists { table: String, id: String },

    /// No live record with this key
    #[error("Record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// mDNS registration or browsing failed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Outbound connection to a peer could not be established
    #[error("Dial failed: {0}")]
    DialFailed(String),

    /// Writing a frame to a peer failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Reading a frame from a peer failed
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// The handshake exchange did not complete
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The sync server could not bind its listen port
    #[error("Server bind failed: {0}")]
    ServerBind(String),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::NotFound {
            table: "diary_entries".to_string(),
            id: "demo-1".to_string(),
        };
        assert_eq!(format!("{}", err), "Record not found: diary_entries/demo-1");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }
}
