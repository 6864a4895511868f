//! Tierline Pipeline
//!
//! The execution half of the release pipeline: the stage graph, the
//! per-environment infra lock, the stage executor and its outcome rules, the
//! rollback engine, the status reporter, and the [`Conductor`] tying them to
//! the decision layer in `tierline-core`.
//!
//! ## Key Components
//!
//! - `stage`: stage names, dependencies, execution plans and time bounds
//! - `lock`: FIFO per-environment lock around `infra-apply` and
//!   `post-infra-validate`, plus release turns for versioned runs
//! - `executor`: [`PipelineRun`] and the [`StageExecutor`] state machine
//! - `rollback`: target resolution and the rollback audit trail
//! - `status`: terminal-only status publication and notifications
//! - `conductor`: end-to-end control flow for events, requests and rollbacks

pub mod cancel;
pub mod conductor;
pub mod executor;
pub mod lock;
pub mod rollback;
pub mod stage;
pub mod status;

pub use cancel::CancelToken;
pub use conductor::{Collaborators, Completion, Conductor, DryRunReport, StateStores};
pub use executor::{compute_outcome, compute_plan_digest, PipelineRun, StageChecks, StageExecutor};
pub use lock::{EnvironmentLocks, InfraLease, ReleaseSequencer, ReleaseTurn};
pub use rollback::{RollbackEngine, RollbackReport, RollbackRequest, RollbackTarget};
pub use stage::{ExecutionPlan, StageBounds, StageName};
pub use status::StatusReporter;
