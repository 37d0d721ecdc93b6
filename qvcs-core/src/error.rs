//! Error types shared by every layer of the archive engine

/// Result type for archive, directory and protocol operations
pub type Result<T> = std::result::Result<T, QvcsError>;

/// Errors that can occur while reading, writing or synchronizing archives
#[derive(Debug, thiserror::Error)]
pub enum QvcsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed archive data: {0}")]
    Format(String),

    #[error("Bad logfile checksum: stored {stored}, computed {computed}")]
    BadChecksum { stored: i16, computed: i16 },

    #[error("Decompression failed: expected {expected} bytes, produced {actual}")]
    DecompressionMismatch { expected: usize, actual: usize },

    #[error("Unknown compression algorithm id: {0}")]
    UnknownCompression(u16),

    #[error("Malformed branch depth sequence at revision index {index} (depth {depth})")]
    MalformedDepthSequence { index: usize, depth: usize },

    #[error("{field} is {length} bytes; stored strings are limited to {max} bytes")]
    StringTooLong { field: &'static str, length: usize, max: usize },

    #[error("Revision not found: {0}")]
    RevisionNotFound(String),

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Archive already exists: {0}")]
    ArchiveExists(String),

    #[error("Archive is locked: {0}")]
    ArchiveLocked(String),

    #[error("Revision {revision} is already locked by {user}")]
    LockConflict { revision: String, user: String },

    #[error("Revision {revision} is not locked by {user}")]
    NotLocked { revision: String, user: String },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Branch info not found: project {project}, branch id {branch_id}")]
    BranchInfoNotFound { project: String, branch_id: i32 },

    #[error("Listener not found for coordinate key: {0}")]
    ListenerNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl QvcsError {
    /// True for errors that mean the archive bytes themselves are corrupt.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            QvcsError::Format(_)
                | QvcsError::BadChecksum { .. }
                | QvcsError::DecompressionMismatch { .. }
                | QvcsError::UnknownCompression(_)
                | QvcsError::MalformedDepthSequence { .. }
        )
    }
}

impl From<bincode::Error> for QvcsError {
    fn from(e: bincode::Error) -> Self {
        QvcsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for QvcsError {
    fn from(e: serde_json::Error) -> Self {
        QvcsError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        assert!(QvcsError::Format("short read".into()).is_corruption());
        assert!(QvcsError::DecompressionMismatch { expected: 10, actual: 9 }.is_corruption());
        assert!(!QvcsError::ConnectionClosed.is_corruption());
        assert!(!QvcsError::UnsupportedOperation("delete".into()).is_corruption());
    }

    #[test]
    fn test_error_messages_are_readable() {
        let err = QvcsError::BranchInfoNotFound { project: "alpha".into(), branch_id: 7 };
        assert_eq!(err.to_string(), "Branch info not found: project alpha, branch id 7");
    }

    #[test]
    fn test_string_too_long_is_not_corruption() {
        let err = QvcsError::StringTooLong { field: "description", length: 70_000, max: 65_534 };
        assert!(!err.is_corruption());
        assert_eq!(err.to_string(), "description is 70000 bytes; stored strings are limited to 65534 bytes");
    }
}
