//! Error types for tierline-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No pipeline run with this ID has been recorded.
    #[error("pipeline run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// No release with this version exists in the environment lineage.
    #[error("release {version} not found in environment {environment}")]
    ReleaseNotFound {
        environment: String,
        version: String,
    },

    /// An append-only entry with the same identity already exists.
    #[error("{kind} already recorded: {key}")]
    Conflict { kind: &'static str, key: String },

    /// A record was submitted in a state the store does not accept.
    #[error("invalid record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    /// An in-process lock guarding a store was poisoned.
    #[error("store lock poisoned")]
    Poisoned,

    /// Backend (database) failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display_names_kind_and_key() {
        let err = StorageError::Conflict {
            kind: "release",
            key: "prod/1.2.0".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("release"));
        assert!(msg.contains("prod/1.2.0"));
    }

    #[test]
    fn test_release_not_found_display() {
        let err = StorageError::ReleaseNotFound {
            environment: "prod".to_string(),
            version: "9.9.9".to_string(),
        };
        assert!(err.to_string().contains("9.9.9"));
        assert!(err.to_string().contains("prod"));
    }
}
