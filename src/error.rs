// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::resolver::DependencyFailure;
use crate::update::MergeError;

/// Core error types for the installation engine
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// The database was written by an older engine and must be migrated
    #[error("database schema version {found} is older than supported version {expected}")]
    OldSchema { found: i32, expected: i32 },

    /// The database was written by a newer engine
    #[error("database schema version {found} is newer than supported version {expected}")]
    NewSchema { found: i32, expected: i32 },

    /// I/O error with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Malformed input (versions, flavors, dependency strings, tag files)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic lookup miss surfaced to a caller
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path is not usable under the install root
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path escapes the install root
    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    /// Trove is not in the local database
    #[error("trove {0} is not installed")]
    TroveMissing(String),

    /// Trove is already present in the local database
    #[error("trove {0} is already installed")]
    TroveAlreadyInstalled(String),

    /// File stream is not in the local database
    #[error("file stream {0} is missing from the database")]
    FileStreamMissing(String),

    /// Two installed troves would own the same path
    #[error("{path} conflicts with a file owned by {owner}")]
    DatabasePathConflict { path: String, owner: String },

    /// Filesystem merge produced conflicts; nothing was touched
    #[error("file system job contains errors:\n{}", format_merge_errors(.0))]
    CommitError(Vec<MergeError>),

    /// Unsatisfied or unresolveable requirements
    #[error("{0}")]
    DependencyFailure(DependencyFailure),

    /// Rollback needs a foreign package whose contents were not stored
    #[error("rollback {0} cannot be applied: capsule contents are not stored locally")]
    MissingRollbackCapsule(String),

    /// Container parse: fewer bytes than the header promised
    #[error("short read: {0}")]
    ShortRead(String),

    /// Container parse: bad magic number
    #[error("invalid magic: {0}")]
    InvalidMagic(String),

    /// Container parse: header truncated or inconsistent
    #[error("incomplete header: {0}")]
    IncompleteHeader(String),

    /// Trove digest mismatch
    #[error("signature error: {0}")]
    SignatureError(String),

    /// Rollback name outside the live range
    #[error("rollback {0} does not exist")]
    RollbackDoesNotExist(String),

    /// Rollbacks were requested out of newest-first order
    #[error("rollback {0} cannot be applied out of order")]
    RollbackOrder(String),

    /// Rollback failed while applying
    #[error("rollback {0} failed: {1}")]
    RollbackError(String, String),

    /// Critical troves were installed; the process must restart to continue
    #[error("critical update applied; restart required (restart data in {0})")]
    ReexecRequired(PathBuf),

    /// Another process holds the root lock
    #[error("could not acquire lock on {0}")]
    Locked(String),

    /// Apply was interrupted by a signal and has been reverted
    #[error("Operation cancelled")]
    Cancelled,

    /// Trove script failure
    #[error("Scriptlet error: {0}")]
    ScriptletError(String),

    /// Foreign packager failure
    #[error("Capsule error: {0}")]
    CapsuleError(String),
}

impl From<MergeError> for Error {
    fn from(err: MergeError) -> Self {
        Error::CommitError(vec![err])
    }
}

fn format_merge_errors(errors: &[MergeError]) -> String {
    errors
        .iter()
        .map(|e| format!("    {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_error_lists_every_conflict() {
        let err = Error::CommitError(vec![
            MergeError::FileTypeChanged {
                path: "/etc/a".to_string(),
            },
            MergeError::FileContentsConflict {
                path: "/etc/b".to_string(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("file type of /etc/a changed"));
        assert!(msg.contains("/etc/b"));
    }

    #[test]
    fn test_schema_messages() {
        let err = Error::OldSchema {
            found: 1,
            expected: 2,
        };
        assert!(err.to_string().contains("older"));
    }
}
