//! Persisted record types
//!
//! Everything in here is written once and never mutated afterwards, except
//! [`EnvironmentStatus`], which is the single replaceable snapshot per
//! environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Outcomes and stage status
// ---------------------------------------------------------------------------

/// Terminal outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// At least one state-changing stage did real work.
    Deployed,
    /// A stage failed, or the run exceeded its wall-clock bound.
    Failed,
    /// The pipeline ran cleanly but every state-changing stage found nothing to do.
    NoChangesDetected,
    /// Refused before any stage ran.
    Rejected,
    /// No state-changing stage was ever attempted.
    ConditionsNotMet,
    /// Cancelled at a safe checkpoint.
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Deployed => "deployed",
            RunOutcome::Failed => "failed",
            RunOutcome::NoChangesDetected => "no_changes_detected",
            RunOutcome::Rejected => "rejected",
            RunOutcome::ConditionsNotMet => "conditions_not_met",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The stage ran its check and found no applicable change.
    NoChanges,
    /// An upstream stage failed.
    UpstreamFailure,
    /// The execution plan left this stage out.
    Excluded,
    /// The run was cancelled before this stage started.
    Cancelled,
}

/// Status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl StageStatus {
    /// Whether the stage has reached a per-stage terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }
}

/// Persisted view of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub depends_on: Vec<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Machine code of the error that failed the stage.
    pub error_code: Option<String>,
    pub error: Option<String>,
}

/// Exclusive infra-mutation window held by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockWindow {
    pub environment: String,
    pub requested_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
    pub released_at: DateTime<Utc>,
}

impl LockWindow {
    /// Whether two windows overlap in time.
    pub fn overlaps(&self, other: &LockWindow) -> bool {
        self.acquired_at < other.released_at && other.acquired_at < self.released_at
    }
}

/// Terminal pipeline run, as appended to the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub run_id: RunId,
    pub environment: String,
    pub tier: String,
    pub trigger: String,
    pub operation: String,
    pub actor: String,
    pub source_ref: String,
    pub version: Option<String>,
    pub release_kind: Option<ReleaseKind>,
    pub outcome: RunOutcome,
    /// Machine-readable outcome code.
    pub code: String,
    /// Human-readable outcome reason.
    pub reason: String,
    pub stages: Vec<StageRecord>,
    pub lock_window: Option<LockWindow>,
    pub plan_digest: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Releases
// ---------------------------------------------------------------------------

/// Release type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    Standard,
    Rc,
    Hotfix,
    Rollback,
}

impl ReleaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseKind::Standard => "standard",
            ReleaseKind::Rc => "rc",
            ReleaseKind::Hotfix => "hotfix",
            ReleaseKind::Rollback => "rollback",
        }
    }
}

/// An immutable versioned release in one environment lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub environment: String,
    /// Normalised version string (no leading `v`).
    pub version: String,
    pub kind: ReleaseKind,
    pub source_revision: String,
    pub created_by: String,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a run that deployed a release. The last one recorded wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseOutcomeRecord {
    pub environment: String,
    pub version: String,
    pub outcome: RunOutcome,
    pub run_id: RunId,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rollbacks and authorization audit
// ---------------------------------------------------------------------------

/// Rollback strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    LastKnownGood,
    SpecificRevision,
    InfrastructureOnly,
    ContentOnly,
}

impl RollbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStrategy::LastKnownGood => "last_known_good",
            RollbackStrategy::SpecificRevision => "specific_revision",
            RollbackStrategy::InfrastructureOnly => "infrastructure_only",
            RollbackStrategy::ContentOnly => "content_only",
        }
    }
}

/// Immutable audit entry for one rollback invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub rollback_id: String,
    pub environment: String,
    pub strategy: RollbackStrategy,
    /// Version of the release rolled back to, when one was resolved.
    pub target_version: Option<String>,
    /// What the caller asked for (revision or strategy default).
    pub target_reference: String,
    /// Traceable `<target>-rollback.<ms>` tag.
    pub rollback_tag: Option<String>,
    pub initiated_by: String,
    pub reason: String,
    pub outcome: RunOutcome,
    pub code: String,
    pub run_id: Option<RunId>,
    pub recorded_at: DateTime<Utc>,
}

/// One allow/deny decision of the authorization gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationDecisionRecord {
    pub actor: String,
    pub environment: String,
    pub operation: String,
    pub role: Option<String>,
    pub allowed: bool,
    pub policy_reason: String,
    pub run_id: RunId,
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Environment status snapshot
// ---------------------------------------------------------------------------

/// Externally visible current status of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub environment: String,
    pub outcome: RunOutcome,
    pub code: String,
    pub timestamp: DateTime<Utc>,
    pub triggering_run_id: RunId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lock_windows_overlap() {
        let base = Utc::now();
        let a = LockWindow {
            environment: "prod".to_string(),
            requested_at: base,
            acquired_at: base,
            released_at: base + Duration::milliseconds(10),
        };
        let b = LockWindow {
            acquired_at: base + Duration::milliseconds(5),
            released_at: base + Duration::milliseconds(20),
            ..a.clone()
        };
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn test_adjacent_lock_windows_do_not_overlap() {
        let base = Utc::now();
        let a = LockWindow {
            environment: "prod".to_string(),
            requested_at: base,
            acquired_at: base,
            released_at: base + Duration::milliseconds(10),
        };
        let b = LockWindow {
            acquired_at: a.released_at,
            released_at: a.released_at + Duration::milliseconds(10),
            ..a.clone()
        };
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_stage_status_serde_shape() {
        let json = serde_json::to_string(&StageStatus::Skipped(SkipReason::NoChanges)).unwrap();
        assert_eq!(json, r#"{"skipped":"no_changes"}"#);
        let json = serde_json::to_string(&StageStatus::Succeeded).unwrap();
        assert_eq!(json, r#""succeeded""#);
    }

    #[test]
    fn test_stage_status_terminal() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped(SkipReason::Excluded).is_terminal());
    }

    #[test]
    fn test_run_outcome_codes() {
        assert_eq!(RunOutcome::NoChangesDetected.as_str(), "no_changes_detected");
        assert_eq!(
            serde_json::to_string(&RunOutcome::ConditionsNotMet).unwrap(),
            r#""conditions_not_met""#
        );
    }
}
