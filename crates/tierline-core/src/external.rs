//! Boundaries to the systems the pipeline drives but does not own.
//!
//! Provisioning, content sync, validation checks and notifications are all
//! injected behind these traits. Command-backed implementations live in
//! [`crate::command`], webhook/log sinks in [`crate::notify`], and fakes in
//! [`crate::fakes`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tierline_state::{RunId, RunOutcome};

use crate::domain::Environment;
use crate::version::Version;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExternalError {
    /// Idempotent and worth one more attempt (throttling, eventual consistency).
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Transient(_))
    }
}

pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

/// What is being deployed: a release version, or a bare source revision for
/// runs that do not cut a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub version: Option<Version>,
    pub revision: String,
}

impl Artifact {
    pub fn release(version: Version, revision: &str) -> Self {
        Self {
            version: Some(version),
            revision: revision.to_string(),
        }
    }

    pub fn revision(revision: &str) -> Self {
        Self {
            version: None,
            revision: revision.to_string(),
        }
    }

    /// Version when present, else the revision.
    pub fn label(&self) -> String {
        match &self.version {
            Some(v) => v.to_string(),
            None => self.revision.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning / content
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub success: bool,
    pub changed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub success: bool,
    pub diff_summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: bool,
    pub changed: bool,
    pub error: Option<String>,
}

/// Result of one convergence poll after an apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Converged,
    Pending,
    Failed(String),
}

/// Materialises infrastructure definitions into real resources.
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    async fn apply(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> ExternalResult<ApplyReport>;

    async fn plan(&self, environment: &Environment, artifact: &Artifact)
        -> ExternalResult<PlanReport>;

    /// Poll whether the last apply has settled. Engines without eventual
    /// consistency report converged immediately.
    async fn converged(
        &self,
        _environment: &Environment,
        _artifact: &Artifact,
    ) -> ExternalResult<Convergence> {
        Ok(Convergence::Converged)
    }
}

/// Publishes site content to an environment.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn sync(&self, environment: &Environment, artifact: &Artifact)
        -> ExternalResult<SyncReport>;
}

// ---------------------------------------------------------------------------
// Validation checks
// ---------------------------------------------------------------------------

/// What a validation check is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckContext {
    pub run_id: RunId,
    pub stage: String,
    pub environment: String,
    pub artifact: Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// One sibling check inside a validation stage (lint, tests, smoke test).
#[async_trait]
pub trait ValidationCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &CheckContext) -> ExternalResult<CheckReport>;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Terminal run summary handed to notification sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub environment: String,
    pub trigger: String,
    pub operation: String,
    pub actor: String,
    pub version: Option<String>,
    pub outcome: RunOutcome,
    pub code: String,
    pub reason: String,
    pub stages: Vec<StageSummary>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub status: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, summary: &RunSummary) -> ExternalResult<()>;
}
