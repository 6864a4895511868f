//! Rollback engine: target resolution and the rollback audit trail.
//!
//! Strategies:
//!
//! - `last_known_good`: newest release before the current one whose last
//!   recorded outcome is `deployed`
//! - `specific_revision`: a named version or source revision, which must
//!   itself have deployed successfully
//! - `infrastructure_only` / `content_only`: like the above (revision when
//!   given, else last known good) but re-running only half of the graph
//!
//! The run itself goes through the normal [`StageExecutor`](crate::StageExecutor);
//! this module decides what to run and records that it happened.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tierline_core::obs;
use tierline_core::{DeployError, Result, Version, VersionManager};
use tierline_state::{
    ReleaseKind, ReleaseRecord, ReleaseRegistry, RollbackLog, RollbackRecord, RollbackStrategy,
    RunId, RunOutcome,
};

use crate::executor::PipelineRun;
use crate::stage::ExecutionPlan;

/// A rollback invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub environment: String,
    pub strategy: RollbackStrategy,
    /// Version or source revision to return to.
    pub revision: Option<String>,
    pub actor: String,
    pub reason: Option<String>,
    /// Use this tag instead of minting one (a pushed rollback tag).
    pub tag: Option<Version>,
}

impl RollbackRequest {
    pub fn new(environment: &str, strategy: RollbackStrategy, actor: &str) -> Self {
        Self {
            environment: environment.to_string(),
            strategy,
            revision: None,
            actor: actor.to_string(),
            reason: None,
            tag: None,
        }
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = Some(revision.to_string());
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_tag(mut self, tag: Version) -> Self {
        self.tag = Some(tag);
        self
    }

    /// What the caller asked for, for the audit record.
    pub fn target_reference(&self) -> String {
        self.revision
            .clone()
            .unwrap_or_else(|| self.strategy.as_str().to_string())
    }
}

/// A resolved rollback target.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackTarget {
    pub release: ReleaseRecord,
    pub version: Version,
    /// Traceable `<target>-rollback.<ms>` tag for this invocation.
    pub tag: Version,
    pub plan: ExecutionPlan,
}

/// Result of one rollback invocation.
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub record: RollbackRecord,
    /// `None` when no run was created (target not found).
    pub run: Option<PipelineRun>,
}

impl RollbackReport {
    pub fn outcome(&self) -> RunOutcome {
        self.record.outcome
    }
}

pub struct RollbackEngine {
    registry: Arc<dyn ReleaseRegistry>,
    log: Arc<dyn RollbackLog>,
    versions: Arc<VersionManager>,
}

impl RollbackEngine {
    pub fn new(
        registry: Arc<dyn ReleaseRegistry>,
        log: Arc<dyn RollbackLog>,
        versions: Arc<VersionManager>,
    ) -> Self {
        Self {
            registry,
            log,
            versions,
        }
    }

    /// Newest release strictly before the current one whose last recorded
    /// outcome is `deployed`. Rollback tags are never candidates.
    pub async fn last_known_good(&self, environment: &str) -> Result<ReleaseRecord> {
        let lineage: Vec<ReleaseRecord> = self
            .registry
            .releases(environment)
            .await?
            .into_iter()
            .filter(|r| r.kind != ReleaseKind::Rollback)
            .collect();

        // Newest first; the head is the current release.
        for release in lineage.iter().skip(1) {
            if self.deployed(environment, &release.version).await? {
                return Ok(release.clone());
            }
        }
        Err(DeployError::RollbackTargetNotFound(format!(
            "no earlier successfully deployed release in {}",
            environment
        )))
    }

    /// Release matching `revision` by version (with or without the `v`) or
    /// by source revision. It must have deployed successfully.
    pub async fn find_revision(&self, environment: &str, revision: &str) -> Result<ReleaseRecord> {
        let wanted = Version::parse(revision).ok();
        let lineage = self.registry.releases(environment).await?;
        let found = lineage.into_iter().filter(|r| r.kind != ReleaseKind::Rollback).find(|r| {
            r.source_revision == revision
                || wanted
                    .as_ref()
                    .is_some_and(|w| Version::parse(&r.version).ok().as_ref() == Some(w))
        });

        match found {
            Some(release) if self.deployed(environment, &release.version).await? => Ok(release),
            Some(release) => Err(DeployError::RollbackTargetNotFound(format!(
                "{} never deployed successfully to {}",
                release.version, environment
            ))),
            None => Err(DeployError::RollbackTargetNotFound(format!(
                "no release '{}' in {}",
                revision, environment
            ))),
        }
    }

    /// Resolve the target release, rollback tag and execution plan.
    pub async fn resolve(
        &self,
        request: &RollbackRequest,
        now: DateTime<Utc>,
    ) -> Result<RollbackTarget> {
        let release = match (request.strategy, request.revision.as_deref()) {
            (RollbackStrategy::SpecificRevision, None) => {
                return Err(DeployError::RollbackTargetNotFound(
                    "specific_revision needs a revision".to_string(),
                ))
            }
            (_, Some(revision)) => self.find_revision(&request.environment, revision).await?,
            (_, None) => self.last_known_good(&request.environment).await?,
        };

        let version = Version::parse(&release.version)?;
        let tag = match &request.tag {
            Some(tag) => tag.clone(),
            None => self.versions.rollback_tag(&version, now),
        };
        let plan = match request.strategy {
            RollbackStrategy::InfrastructureOnly => ExecutionPlan::infrastructure_only(),
            RollbackStrategy::ContentOnly => ExecutionPlan::content_only(),
            RollbackStrategy::LastKnownGood | RollbackStrategy::SpecificRevision => {
                ExecutionPlan::full()
            }
        };

        tracing::info!(
            environment = %request.environment,
            strategy = request.strategy.as_str(),
            target = %version,
            tag = %tag,
            "rollback target resolved"
        );
        Ok(RollbackTarget {
            release,
            version,
            tag,
            plan,
        })
    }

    /// Append the immutable audit entry for one invocation.
    pub async fn record(
        &self,
        request: &RollbackRequest,
        target: Option<&RollbackTarget>,
        outcome: RunOutcome,
        code: &str,
        run_id: Option<&RunId>,
    ) -> Result<RollbackRecord> {
        let record = RollbackRecord {
            rollback_id: uuid::Uuid::new_v4().to_string(),
            environment: request.environment.clone(),
            strategy: request.strategy,
            target_version: target.map(|t| t.version.to_string()),
            target_reference: request.target_reference(),
            rollback_tag: target.map(|t| t.tag.to_string()),
            initiated_by: request.actor.clone(),
            reason: request.reason.clone().unwrap_or_default(),
            outcome,
            code: code.to_string(),
            run_id: run_id.cloned(),
            recorded_at: Utc::now(),
        };
        self.log.append(&record).await?;
        obs::emit_rollback_recorded(
            &record.environment,
            record.strategy.as_str(),
            record.target_version.as_deref().unwrap_or(&record.target_reference),
            outcome.as_str(),
        );
        Ok(record)
    }

    async fn deployed(&self, environment: &str, version: &str) -> Result<bool> {
        Ok(self
            .registry
            .last_outcome(environment, version)
            .await?
            .is_some_and(|o| o.outcome == RunOutcome::Deployed))
    }
}
