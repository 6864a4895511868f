//! Storage trait definitions for Tierline
//!
//! These traits define the persisted-state contracts:
//! - `RunHistory`: append-only terminal pipeline runs
//! - `ReleaseRegistry`: immutable releases plus their appended outcomes
//! - `RollbackLog`: immutable rollback audit entries
//! - `AuthorizationAudit`: every gate decision, allow or deny
//! - `StatusBoard`: the one current-status snapshot per environment
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! via the `fakes` module.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{
    AuthorizationDecisionRecord, EnvironmentStatus, PipelineRunRecord, ReleaseOutcomeRecord,
    ReleaseRecord, RollbackRecord, RunId,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// RunHistory
// ---------------------------------------------------------------------------

/// Append-only history of terminal pipeline runs.
///
/// Guarantees:
/// - A run ID is recorded at most once (`Conflict` otherwise).
/// - `list_runs` returns runs in the order they were recorded.
#[async_trait]
pub trait RunHistory: Send + Sync {
    /// Append a terminal run.
    async fn record_run(&self, run: &PipelineRunRecord) -> StorageResult<()>;

    /// Retrieve a run by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRunRecord>;

    /// List runs, optionally filtered by environment, oldest first.
    async fn list_runs(&self, environment: Option<&str>) -> StorageResult<Vec<PipelineRunRecord>>;
}

// ---------------------------------------------------------------------------
// ReleaseRegistry
// ---------------------------------------------------------------------------

/// Release lineage per environment.
///
/// Semantics:
/// - `record_release` appends an immutable release; `(environment, version)`
///   is unique.
/// - `record_outcome` appends an outcome for an existing release; the last
///   recorded outcome is authoritative.
/// - `releases` returns the lineage newest first.
#[async_trait]
pub trait ReleaseRegistry: Send + Sync {
    async fn record_release(&self, release: &ReleaseRecord) -> StorageResult<()>;

    async fn record_outcome(&self, outcome: &ReleaseOutcomeRecord) -> StorageResult<()>;

    async fn releases(&self, environment: &str) -> StorageResult<Vec<ReleaseRecord>>;

    async fn last_outcome(
        &self,
        environment: &str,
        version: &str,
    ) -> StorageResult<Option<ReleaseOutcomeRecord>>;
}

// ---------------------------------------------------------------------------
// RollbackLog / AuthorizationAudit
// ---------------------------------------------------------------------------

/// Append-only rollback audit trail.
#[async_trait]
pub trait RollbackLog: Send + Sync {
    async fn append(&self, record: &RollbackRecord) -> StorageResult<()>;

    /// Entries oldest first, optionally filtered by environment.
    async fn list(&self, environment: Option<&str>) -> StorageResult<Vec<RollbackRecord>>;
}

/// Append-only authorization decision trail.
#[async_trait]
pub trait AuthorizationAudit: Send + Sync {
    async fn append(&self, decision: &AuthorizationDecisionRecord) -> StorageResult<()>;

    /// Entries oldest first, optionally filtered by environment.
    async fn list(
        &self,
        environment: Option<&str>,
    ) -> StorageResult<Vec<AuthorizationDecisionRecord>>;
}

// ---------------------------------------------------------------------------
// StatusBoard
// ---------------------------------------------------------------------------

/// Current-status snapshot per environment, read-only to dashboards.
///
/// `publish` replaces the snapshot atomically and returns `false` without
/// writing when the stored snapshot is newer than the one offered.
#[async_trait]
pub trait StatusBoard: Send + Sync {
    async fn publish(&self, status: &EnvironmentStatus) -> StorageResult<bool>;

    async fn current(&self, environment: &str) -> StorageResult<Option<EnvironmentStatus>>;

    /// All snapshots, ordered by environment name.
    async fn all(&self) -> StorageResult<Vec<EnvironmentStatus>>;
}
