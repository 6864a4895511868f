//! Tierline-State: deployment history persistence
//!
//! This crate owns every piece of state the release pipeline shares across
//! runs: the append-only history of pipeline runs, releases, rollback and
//! authorization audit entries, and the one current-status snapshot per
//! environment that dashboards read.
//!
//! ## Key Components
//!
//! - `storage_traits`: backend-agnostic async contracts
//! - `fakes`: in-memory implementations
//! - `SurrealHandle` / `SurrealStateStore`: SurrealDB backend

mod error;
pub mod fakes;
mod handle;
mod schema;
pub mod storage_traits;
mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{CloudConfig, SurrealHandle};
pub use schema::{
    AuthorizationDecisionRecord, EnvironmentStatus, LockWindow, PipelineRunRecord, ReleaseKind,
    ReleaseOutcomeRecord, ReleaseRecord, RollbackRecord, RollbackStrategy, RunId, RunOutcome,
    SkipReason, StageRecord, StageStatus,
};
pub use storage_traits::{
    AuthorizationAudit, ReleaseRegistry, RollbackLog, RunHistory, StatusBoard, StorageResult,
};
pub use surreal_store::SurrealStateStore;
