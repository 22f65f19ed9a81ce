/*
    errors.rs - Error types for the store subsystem

    Defines all error types that can occur in:
    - Loading and decoding a store file
    - Persisting a committed snapshot
    - Caller-supplied transactions
    - Registry lifecycle (open / close)
*/

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the store subsystem
#[derive(Debug, Clone, Error)]
pub enum DataStoreError {
    /// Bytes on disk do not decode. Structural, not retried automatically.
    #[error("Corrupted store file {}: {cause}", path.display())]
    Corruption { path: PathBuf, cause: String },

    /// Storage I/O error. Transient, safe to retry the same operation.
    #[error("I/O error on {}: {cause}", path.display())]
    Io {
        path: PathBuf,
        kind: std::io::ErrorKind,
        cause: String,
    },

    /// The caller-supplied transaction failed
    #[error("Transaction failed: {cause}")]
    Transaction { cause: String },

    /// A value could not be encoded by the store's codec
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A store was reopened with a different value type
    #[error("Store '{name}' is already open with a different value type")]
    TypeMismatch { name: String },

    /// Store names map directly to file names inside the data directory
    #[error("Invalid store name: {0:?}")]
    InvalidName(String),

    /// The store or registry has been closed
    #[error("Store is closed: {0}")]
    Closed(String),

    /// The operation was cancelled before its transaction started
    #[error("Update cancelled before it started")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataStoreError {
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        DataStoreError::Io {
            path: path.into(),
            kind: err.kind(),
            cause: err.to_string(),
        }
    }

    pub fn corruption(path: impl Into<PathBuf>, cause: impl ToString) -> Self {
        DataStoreError::Corruption {
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    pub fn transaction(cause: impl ToString) -> Self {
        DataStoreError::Transaction {
            cause: cause.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed without caller intervention
    pub fn is_retriable(&self) -> bool {
        matches!(self, DataStoreError::Io { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, DataStoreError::Corruption { .. })
    }
}

/// Result type for store operations
pub type DataStoreResult<T> = Result<T, DataStoreError>;

/// Codec-specific errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input bytes are not well-formed for the declared schema
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Checksum over the payload did not match
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Format version is not understood by this codec
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),

    /// Encoding an in-memory value failed
    #[error("Encoding failed: {0}")]
    Encode(String),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        CodecError::Malformed(err.to_string())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_error_display() {
        let err = DataStoreError::corruption("/tmp/settings.pb", "bad magic");
        assert_eq!(err.to_string(), "Corrupted store file /tmp/settings.pb: bad magic");
        assert!(err.is_corruption());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_io_error_is_retriable() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = DataStoreError::io("/tmp/x", &io);
        assert!(err.is_retriable());
        match err {
            DataStoreError::Io { kind, .. } => {
                assert_eq!(kind, std::io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_transaction_error_not_retriable() {
        let err = DataStoreError::transaction("counter overflow");
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("counter overflow"));
    }

    #[test]
    fn test_checksum_error_display() {
        let err = CodecError::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 1,
        };
        assert!(err.to_string().contains("0xdeadbeef"));
        assert!(err.to_string().contains("0x00000001"));
    }
}
