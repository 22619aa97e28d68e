//! Typed error hierarchy for the Vigil orchestrator.
//!
//! Each enum is scoped to the level at which the failure is contained:
//! - `ConfigError`: fatal, raised before any orchestration cycle
//! - `VcsError`: per project, the project is skipped for this cycle
//! - `SpawnError`: per commit, the commit is finalized as failed
//! - `StorageError`: persistence failures, retried by the orchestrator
//! - `CoordinatorError`: registry lookups and registration

use std::path::PathBuf;

use thiserror::Error;

/// Configuration problems found while loading projects. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}. Define your projects there first.")]
    NotFound { path: PathBuf },

    #[error("Failed to read configuration file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file at {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration:\n  - {}", .violations.join("\n  - "))]
    Invalid { violations: Vec<String> },
}

/// The version-control remote or the local checkout is unusable.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git {operation} failed for {slug}: {message}")]
    Unavailable {
        slug: String,
        operation: &'static str,
        message: String,
    },

    #[error("Branch {branch} not found in repository for {slug}")]
    BranchNotFound { slug: String, branch: String },

    #[error("Commit {sha} does not resolve in repository for {slug}")]
    UnknownCommit { slug: String, sha: String },

    #[error("Failed to run git binary: {0}")]
    Io(#[source] std::io::Error),
}

/// The build command could not be started at all.
#[derive(Debug, Error)]
#[error("Failed to spawn `{command}` in {working_dir}: {source}")]
pub struct SpawnError {
    pub command: String,
    pub working_dir: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Errors from the SQLite-backed storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Commit {sha} is already recorded for project {slug}")]
    Duplicate { slug: String, sha: String },

    #[error("No building commit {sha} for project {slug}")]
    MissingRow { slug: String, sha: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task panicked: {0}")]
    TaskPanicked(String),

    #[error("Invalid stored value for column '{column}': {message}")]
    InvalidColumn { column: String, message: String },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors from the project registry.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Project {slug} not found")]
    NotFound { slug: String },

    #[error("Project slug {slug} is registered more than once")]
    DuplicateSlug { slug: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_lists_every_violation() {
        let err = ConfigError::Invalid {
            violations: vec![
                "project #1: name is empty".to_string(),
                "duplicate slug 'app'".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("name is empty"));
        assert!(msg.contains("duplicate slug 'app'"));
    }

    #[test]
    fn vcs_error_carries_slug_and_operation() {
        let err = VcsError::Unavailable {
            slug: "app".to_string(),
            operation: "fetch",
            message: "could not resolve host".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("fetch"));
        assert!(msg.contains("app"));
    }

    #[test]
    fn spawn_error_exposes_io_source() {
        use std::error::Error as _;
        let err = SpawnError {
            command: "make".to_string(),
            working_dir: PathBuf::from("/nowhere"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such dir"),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("/nowhere"));
    }

    #[test]
    fn coordinator_error_converts_from_storage_error() {
        let err: CoordinatorError = StorageError::LockPoisoned.into();
        assert!(matches!(
            err,
            CoordinatorError::Storage(StorageError::LockPoisoned)
        ));
    }

    #[test]
    fn storage_duplicate_is_matchable() {
        let err = StorageError::Duplicate {
            slug: "app".into(),
            sha: "abc".into(),
        };
        assert!(matches!(err, StorageError::Duplicate { .. }));
        assert!(err.to_string().contains("abc"));
    }
}
