//! Stage executor: drives one [`PipelineRun`] through the stage graph.
//!
//! Each run executes sequentially. Inside a validation stage the sibling
//! checks fan out concurrently and join before the graph advances.
//!
//! Time is bounded twice: every stage attempt gets `min(stage timeout,
//! remaining run budget)`, so the overall run bound dominates without
//! abandoning a stage half-recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use sha2::{Digest, Sha256};
use tierline_core::config::{CheckConfig, ChecksConfig, TimeoutConfig};
use tierline_core::obs;
use tierline_core::{
    Artifact, CheckContext, CommandCheck, ContentStore, Convergence, DeployError,
    DeploymentRequest, Environment, ExternalError, Operation, ProvisioningEngine, RunSummary,
    StageSummary, ValidationCheck, METRICS,
};
use tierline_state::{
    LockWindow, PipelineRunRecord, ReleaseKind, RunId, RunOutcome, SkipReason, StageRecord,
    StageStatus,
};
use tokio::time::Instant;
use tracing::Instrument;

use crate::cancel::CancelToken;
use crate::lock::{EnvironmentLocks, InfraLease};
use crate::stage::{ExecutionPlan, StageBounds, StageName};

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

/// One end-to-end execution of the stage graph for a single request.
///
/// Fields are private: only the executor moves a run between states.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    run_id: RunId,
    request: DeploymentRequest,
    environment: Environment,
    operation: Operation,
    artifact: Artifact,
    release_kind: Option<ReleaseKind>,
    plan: ExecutionPlan,
    stages: Vec<StageRecord>,
    outcome: Option<RunOutcome>,
    code: String,
    reason: String,
    lock_window: Option<LockWindow>,
    plan_digest: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(
        request: DeploymentRequest,
        environment: Environment,
        operation: Operation,
        artifact: Artifact,
        plan: ExecutionPlan,
    ) -> Self {
        let plan_digest = compute_plan_digest(&environment.name, &artifact, &plan);
        let stages = StageName::ALL
            .iter()
            .map(|stage| StageRecord {
                name: stage.as_str().to_string(),
                status: StageStatus::Pending,
                depends_on: stage
                    .depends_on()
                    .iter()
                    .map(|d| d.as_str().to_string())
                    .collect(),
                attempts: 0,
                started_at: None,
                finished_at: None,
                error_code: None,
                error: None,
            })
            .collect();

        Self {
            run_id: RunId::new(),
            request,
            environment,
            operation,
            release_kind: artifact.version.as_ref().map(|v| v.kind()),
            artifact,
            plan,
            stages,
            outcome: None,
            code: String::new(),
            reason: String::new(),
            lock_window: None,
            plan_digest,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Use a run id allocated earlier (e.g. for the authorization audit).
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_release_kind(mut self, kind: ReleaseKind) -> Self {
        self.release_kind = Some(kind);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn request(&self) -> &DeploymentRequest {
        &self.request
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn release_kind(&self) -> Option<ReleaseKind> {
        self.release_kind
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn stage(&self, name: StageName) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name.as_str())
    }

    pub fn stage_status(&self, name: StageName) -> Option<StageStatus> {
        self.stage(name).map(|s| s.status)
    }

    /// `None` while the run is in flight.
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn lock_window(&self) -> Option<&LockWindow> {
        self.lock_window.as_ref()
    }

    pub fn plan_digest(&self) -> &str {
        &self.plan_digest
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some() && self.completed_at.is_some()
    }

    /// Persisted form. `None` until the run is terminal.
    pub fn to_record(&self) -> Option<PipelineRunRecord> {
        let (outcome, completed_at) = (self.outcome?, self.completed_at?);
        Some(PipelineRunRecord {
            run_id: self.run_id.clone(),
            environment: self.environment.name.clone(),
            tier: self.environment.tier.as_str().to_string(),
            trigger: self.request.trigger_type().as_str().to_string(),
            operation: self.operation.as_str().to_string(),
            actor: self.request.actor.clone(),
            source_ref: self.request.source_ref.clone(),
            version: self.artifact.version.as_ref().map(|v| v.to_string()),
            release_kind: self.release_kind,
            outcome,
            code: self.code.clone(),
            reason: self.reason.clone(),
            stages: self.stages.clone(),
            lock_window: self.lock_window.clone(),
            plan_digest: self.plan_digest.clone(),
            started_at: self.started_at,
            completed_at,
        })
    }

    /// Notification payload. `None` until the run is terminal.
    pub fn summary(&self) -> Option<RunSummary> {
        let (outcome, completed_at) = (self.outcome?, self.completed_at?);
        Some(RunSummary {
            run_id: self.run_id.clone(),
            environment: self.environment.name.clone(),
            trigger: self.request.trigger_type().as_str().to_string(),
            operation: self.operation.as_str().to_string(),
            actor: self.request.actor.clone(),
            version: self.artifact.version.as_ref().map(|v| v.to_string()),
            outcome,
            code: self.code.clone(),
            reason: self.reason.clone(),
            stages: self
                .stages
                .iter()
                .map(|s| StageSummary {
                    name: s.name.clone(),
                    status: status_label(s.status),
                })
                .collect(),
            started_at: self.started_at,
            completed_at,
        })
    }

    /// `None` once the stage list has been cleared by a rejection.
    fn record_mut(&mut self, stage: StageName) -> Option<&mut StageRecord> {
        let name = stage.as_str();
        self.stages.iter_mut().find(|s| s.name == name)
    }

    fn set_status(&mut self, stage: StageName, status: StageStatus) {
        let run_id = self.run_id.0.clone();
        let Some(record) = self.record_mut(stage) else {
            return;
        };
        let now = Utc::now();
        match status {
            StageStatus::Running => record.started_at = Some(now),
            s if s.is_terminal() => record.finished_at = Some(now),
            _ => {}
        }
        record.status = status;
        obs::emit_stage_transition(&run_id, stage.as_str(), &status_label(status), record.attempts);
    }

    fn finish(&mut self, outcome: RunOutcome, code: &str, reason: String) {
        let completed_at = Utc::now();
        self.outcome = Some(outcome);
        self.code = code.to_string();
        self.reason = reason;
        self.completed_at = Some(completed_at);

        match outcome {
            RunOutcome::Deployed => METRICS.inc_runs_deployed(),
            RunOutcome::Failed => METRICS.inc_runs_failed(),
            RunOutcome::Rejected => METRICS.inc_runs_rejected(),
            _ => {}
        }
        let duration_ms = (completed_at - self.started_at).num_milliseconds().max(0) as u64;
        obs::emit_run_finished(
            &self.run_id.0,
            &self.environment.name,
            outcome.as_str(),
            code,
            duration_ms,
        );
    }
}

fn status_label(status: StageStatus) -> String {
    match status {
        StageStatus::Pending => "pending".to_string(),
        StageStatus::Running => "running".to_string(),
        StageStatus::Succeeded => "succeeded".to_string(),
        StageStatus::Failed => "failed".to_string(),
        StageStatus::Skipped(reason) => {
            let reason = match reason {
                SkipReason::NoChanges => "no_changes",
                SkipReason::UpstreamFailure => "upstream_failure",
                SkipReason::Excluded => "excluded",
                SkipReason::Cancelled => "cancelled",
            };
            format!("skipped:{}", reason)
        }
    }
}

/// SHA-256 over environment, artifact and the ordered included stage names.
pub fn compute_plan_digest(environment: &str, artifact: &Artifact, plan: &ExecutionPlan) -> String {
    let mut hasher = Sha256::new();
    hasher.update(environment.as_bytes());
    hasher.update(b"\0");
    hasher.update(artifact.label().as_bytes());
    hasher.update(b"\0");
    for stage in plan.stages() {
        hasher.update(stage.as_str().as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal outcome of a run whose stages are all terminal.
///
/// Precedence: failed, deployed (a state-changing stage succeeded, even if
/// the run was cancelled afterwards), cancelled, no changes (every
/// state-changing stage that was considered found nothing to do),
/// conditions not met.
pub fn compute_outcome(run: &PipelineRun) -> (RunOutcome, String, String) {
    if let Some(failed) = run.stages.iter().find(|s| s.status == StageStatus::Failed) {
        let code = failed
            .error_code
            .clone()
            .unwrap_or_else(|| "stage_failed".to_string());
        let reason = format!(
            "{} failed: {}",
            failed.name,
            failed.error.as_deref().unwrap_or("unknown error")
        );
        return (RunOutcome::Failed, code, reason);
    }

    let cancelled = run
        .stages
        .iter()
        .find(|s| s.status == StageStatus::Skipped(SkipReason::Cancelled));

    let mutating: Vec<(StageName, StageStatus)> = StageName::ALL
        .into_iter()
        .filter(|s| s.is_mutating())
        .filter_map(|s| run.stage_status(s).map(|status| (s, status)))
        .collect();

    let changed: Vec<&str> = mutating
        .iter()
        .filter(|(_, status)| *status == StageStatus::Succeeded)
        .map(|(s, _)| s.as_str())
        .collect();
    if !changed.is_empty() {
        let mut reason = format!(
            "deployed {} to {} ({})",
            run.artifact.label(),
            run.environment.name,
            changed.join(", ")
        );
        if let Some(cancelled) = cancelled {
            reason.push_str(&format!("; cancelled before {}", cancelled.name));
        }
        return (RunOutcome::Deployed, "deployed".to_string(), reason);
    }

    if let Some(cancelled) = cancelled {
        return (
            RunOutcome::Cancelled,
            "cancelled".to_string(),
            format!("run cancelled before {}", cancelled.name),
        );
    }

    let considered: Vec<StageStatus> = mutating
        .iter()
        .map(|(_, status)| *status)
        .filter(|status| *status != StageStatus::Skipped(SkipReason::Excluded))
        .collect();
    if !considered.is_empty()
        && considered
            .iter()
            .all(|s| *s == StageStatus::Skipped(SkipReason::NoChanges))
    {
        return (
            RunOutcome::NoChangesDetected,
            "no_changes_detected".to_string(),
            format!("{} already matches {}", run.environment.name, run.artifact.label()),
        );
    }

    (
        RunOutcome::ConditionsNotMet,
        "conditions_not_met".to_string(),
        "no state-changing stage ran".to_string(),
    )
}

// ---------------------------------------------------------------------------
// Validation checks per stage
// ---------------------------------------------------------------------------

/// Sibling checks for each validation stage.
#[derive(Clone, Default)]
pub struct StageChecks {
    pub build_validate: Vec<Arc<dyn ValidationCheck>>,
    pub test_validate: Vec<Arc<dyn ValidationCheck>>,
    pub post_infra_validate: Vec<Arc<dyn ValidationCheck>>,
    pub post_deploy_validate: Vec<Arc<dyn ValidationCheck>>,
}

impl StageChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command-backed checks from configuration.
    pub fn from_config(config: &ChecksConfig) -> Self {
        let build = |checks: &[CheckConfig]| -> Vec<Arc<dyn ValidationCheck>> {
            checks
                .iter()
                .map(|c| {
                    Arc::new(CommandCheck::new(&c.name, c.command.clone())) as Arc<dyn ValidationCheck>
                })
                .collect()
        };
        Self {
            build_validate: build(&config.build_validate),
            test_validate: build(&config.test_validate),
            post_infra_validate: build(&config.post_infra_validate),
            post_deploy_validate: build(&config.post_deploy_validate),
        }
    }

    pub fn with_check(mut self, stage: StageName, check: Arc<dyn ValidationCheck>) -> Self {
        match stage {
            StageName::BuildValidate => self.build_validate.push(check),
            StageName::TestValidate => self.test_validate.push(check),
            StageName::PostInfraValidate => self.post_infra_validate.push(check),
            StageName::PostDeployValidate => self.post_deploy_validate.push(check),
            StageName::InfraApply | StageName::ContentDeploy => {
                tracing::warn!(stage = %stage, "ignoring check on a non-validation stage")
            }
        }
        self
    }

    pub fn for_stage(&self, stage: StageName) -> &[Arc<dyn ValidationCheck>] {
        match stage {
            StageName::BuildValidate => &self.build_validate,
            StageName::TestValidate => &self.test_validate,
            StageName::PostInfraValidate => &self.post_infra_validate,
            StageName::PostDeployValidate => &self.post_deploy_validate,
            StageName::InfraApply | StageName::ContentDeploy => &[],
        }
    }
}

impl std::fmt::Debug for StageChecks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |checks: &[Arc<dyn ValidationCheck>]| {
            checks.iter().map(|c| c.name().to_string()).collect::<Vec<_>>()
        };
        f.debug_struct("StageChecks")
            .field("build_validate", &names(&self.build_validate))
            .field("test_validate", &names(&self.test_validate))
            .field("post_infra_validate", &names(&self.post_infra_validate))
            .field("post_deploy_validate", &names(&self.post_deploy_validate))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StageExecutor
// ---------------------------------------------------------------------------

/// What a single stage attempt concluded.
enum Step {
    Succeeded,
    NoChanges,
    Cancelled,
}

/// Runs the stage graph against injected collaborators.
pub struct StageExecutor {
    provisioner: Arc<dyn ProvisioningEngine>,
    content: Arc<dyn ContentStore>,
    checks: StageChecks,
    locks: Arc<EnvironmentLocks>,
    timeouts: TimeoutConfig,
}

impl StageExecutor {
    pub fn new(
        provisioner: Arc<dyn ProvisioningEngine>,
        content: Arc<dyn ContentStore>,
        checks: StageChecks,
        locks: Arc<EnvironmentLocks>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            provisioner,
            content,
            checks,
            locks,
            timeouts,
        }
    }

    pub fn provisioner(&self) -> &Arc<dyn ProvisioningEngine> {
        &self.provisioner
    }

    /// Terminate a run before any stage: zero stages, outcome `Rejected`.
    pub fn reject(&self, mut run: PipelineRun, error: &DeployError) -> PipelineRun {
        METRICS.inc_runs_started();
        obs::emit_run_started(
            &run.run_id.0,
            &run.environment.name,
            run.request.trigger_type().as_str(),
            &run.request.actor,
        );
        run.stages.clear();
        run.finish(RunOutcome::Rejected, error.code(), error.to_string());
        run
    }

    /// Drive `run` to a terminal outcome. Never fails: every error lands in
    /// a stage record and the run outcome.
    pub async fn execute(&self, run: PipelineRun, cancel: &CancelToken) -> PipelineRun {
        let span = obs::run_span(&run.run_id.0, &run.environment.name);
        self.drive(run, cancel).instrument(span).await
    }

    async fn drive(&self, mut run: PipelineRun, cancel: &CancelToken) -> PipelineRun {
        METRICS.inc_runs_started();
        obs::emit_run_started(
            &run.run_id.0,
            &run.environment.name,
            run.request.trigger_type().as_str(),
            &run.request.actor,
        );

        let bounds = StageBounds::resolve(&self.timeouts, &run.environment);
        let deadline = Instant::now() + bounds.run;
        let mut lease: Option<InfraLease> = None;

        for stage in StageName::ALL {
            if !stage.holds_infra_lock() {
                if let Some(held) = lease.take() {
                    run.lock_window = Some(held.release());
                }
            }

            if !run.plan.includes(stage) {
                run.set_status(stage, StageStatus::Skipped(SkipReason::Excluded));
                continue;
            }
            if upstream_failed(&run, stage) {
                run.set_status(stage, StageStatus::Skipped(SkipReason::UpstreamFailure));
                continue;
            }
            // Inside the lock window cancellation waits for the window to close.
            if lease.is_none() && cancel.is_cancelled() {
                run.set_status(stage, StageStatus::Skipped(SkipReason::Cancelled));
                continue;
            }

            run.set_status(stage, StageStatus::Running);

            if stage == StageName::InfraApply {
                match self.acquire_lease(&run, &bounds, deadline).await {
                    Ok(held) => lease = Some(held),
                    Err(e) => {
                        self.fail_stage(&mut run, stage, &e);
                        continue;
                    }
                }
            }

            match self.run_with_retry(&mut run, stage, &bounds, deadline, cancel).await {
                Ok(Step::Succeeded) => run.set_status(stage, StageStatus::Succeeded),
                Ok(Step::NoChanges) => {
                    run.set_status(stage, StageStatus::Skipped(SkipReason::NoChanges))
                }
                Ok(Step::Cancelled) => {
                    run.set_status(stage, StageStatus::Skipped(SkipReason::Cancelled))
                }
                Err(e) => self.fail_stage(&mut run, stage, &e),
            }
        }

        if let Some(held) = lease.take() {
            run.lock_window = Some(held.release());
        }

        let (outcome, code, reason) = compute_outcome(&run);
        run.finish(outcome, &code, reason);
        run
    }

    fn fail_stage(&self, run: &mut PipelineRun, stage: StageName, error: &DeployError) {
        tracing::warn!(stage = %stage, code = error.code(), error = %error, "stage failed");
        if let Some(record) = run.record_mut(stage) {
            record.error_code = Some(error.code().to_string());
            record.error = Some(error.to_string());
        }
        run.set_status(stage, StageStatus::Failed);
    }

    async fn acquire_lease(
        &self,
        run: &PipelineRun,
        bounds: &StageBounds,
        deadline: Instant,
    ) -> tierline_core::Result<InfraLease> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.locks
            .acquire(&run.environment.name, &run.run_id, bounds.lock_queue.min(remaining))
            .await
    }

    /// One attempt, plus a single retry after backoff when the failure is
    /// transient (apply/sync) or a convergence timeout (post-infra-validate).
    async fn run_with_retry(
        &self,
        run: &mut PipelineRun,
        stage: StageName,
        bounds: &StageBounds,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> tierline_core::Result<Step> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(record) = run.record_mut(stage) {
                record.attempts = attempt;
            }

            let result = self.attempt(run, stage, bounds, deadline, cancel).await;
            let retry = match &result {
                Err(e) if attempt == 1 => match stage {
                    StageName::InfraApply | StageName::ContentDeploy => e.is_retryable(),
                    StageName::PostInfraValidate => {
                        matches!(e, DeployError::StageTimeout { .. })
                    }
                    _ => false,
                },
                _ => false,
            };
            if !retry {
                return result;
            }

            METRICS.inc_stage_retries();
            if let Err(e) = &result {
                tracing::info!(stage = %stage, error = %e, "retrying stage once");
            }
            obs::emit_stage_transition(&run.run_id.0, stage.as_str(), "retrying", attempt + 1);
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(bounds.retry_backoff.min(remaining)).await;
        }
    }

    async fn attempt(
        &self,
        run: &PipelineRun,
        stage: StageName,
        bounds: &StageBounds,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> tierline_core::Result<Step> {
        let stage_timeout = bounds.timeout_for(stage);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = stage_timeout.min(remaining);
        let run_bound = budget < stage_timeout;

        let work = async {
            match stage {
                _ if stage.is_cancellable_mid_stage() => {
                    tokio::select! {
                        result = self.validate(run, stage) => result,
                        _ = cancel.cancelled() => Ok(Step::Cancelled),
                    }
                }
                StageName::InfraApply => self.apply(run).await,
                StageName::PostInfraValidate => {
                    self.await_convergence(run, bounds).await?;
                    self.validate(run, stage).await
                }
                StageName::ContentDeploy => self.deploy_content(run).await,
                StageName::BuildValidate
                | StageName::TestValidate
                | StageName::PostDeployValidate => self.validate(run, stage).await,
            }
        };

        match tokio::time::timeout(budget, work).await {
            Ok(result) => result,
            Err(_) if run_bound => Err(DeployError::RunTimeout {
                timeout_ms: bounds.run.as_millis() as u64,
            }),
            Err(_) => Err(DeployError::StageTimeout {
                stage: stage.as_str().to_string(),
                timeout_ms: stage_timeout.as_millis() as u64,
            }),
        }
    }

    async fn validate(&self, run: &PipelineRun, stage: StageName) -> tierline_core::Result<Step> {
        let checks = self.checks.for_stage(stage);
        if checks.is_empty() {
            return Ok(Step::Succeeded);
        }

        let ctx = CheckContext {
            run_id: run.run_id.clone(),
            stage: stage.as_str().to_string(),
            environment: run.environment.name.clone(),
            artifact: run.artifact.clone(),
        };
        let results = join_all(checks.iter().map(|check| {
            let ctx = &ctx;
            async move { (check.name().to_string(), check.run(ctx).await) }
        }))
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(report) if report.passed => None,
                Ok(report) => Some(format!("{}: {}", name, report.detail)),
                Err(e) => Some(format!("{}: {}", name, e)),
            })
            .collect();

        if failures.is_empty() {
            Ok(Step::Succeeded)
        } else {
            Err(DeployError::StageValidationFailure {
                stage: stage.as_str().to_string(),
                reason: failures.join("; "),
            })
        }
    }

    async fn apply(&self, run: &PipelineRun) -> tierline_core::Result<Step> {
        let report = self
            .provisioner
            .apply(&run.environment, &run.artifact)
            .await
            .map_err(|e| provisioning_error(StageName::InfraApply, e))?;
        changed_step(StageName::InfraApply, report.success, report.changed, report.error)
    }

    async fn deploy_content(&self, run: &PipelineRun) -> tierline_core::Result<Step> {
        let report = self
            .content
            .sync(&run.environment, &run.artifact)
            .await
            .map_err(|e| provisioning_error(StageName::ContentDeploy, e))?;
        changed_step(StageName::ContentDeploy, report.success, report.changed, report.error)
    }

    /// Poll until converged, backing off exponentially. A transient poll
    /// error counts as still pending; the caller's timeout bounds the wait.
    async fn await_convergence(
        &self,
        run: &PipelineRun,
        bounds: &StageBounds,
    ) -> tierline_core::Result<()> {
        let mut backoff = bounds.convergence_initial_backoff;
        loop {
            match self
                .provisioner
                .converged(&run.environment, &run.artifact)
                .await
            {
                Ok(Convergence::Converged) => return Ok(()),
                Ok(Convergence::Pending) => {}
                Err(ExternalError::Transient(e)) => {
                    tracing::debug!(error = %e, "convergence poll failed, treating as pending")
                }
                Ok(Convergence::Failed(reason)) => {
                    return Err(DeployError::StageValidationFailure {
                        stage: StageName::PostInfraValidate.as_str().to_string(),
                        reason,
                    })
                }
                Err(ExternalError::Permanent(reason)) => {
                    return Err(DeployError::ProvisioningError {
                        stage: StageName::PostInfraValidate.as_str().to_string(),
                        reason,
                        transient: false,
                    })
                }
            }
            tokio::time::sleep(backoff).await;
            let ceiling = bounds.convergence_max_backoff.max(Duration::from_millis(1));
            backoff = (backoff * 2).min(ceiling);
        }
    }
}

fn upstream_failed(run: &PipelineRun, stage: StageName) -> bool {
    stage.depends_on().iter().any(|dep| {
        matches!(
            run.stage_status(*dep),
            Some(StageStatus::Failed) | Some(StageStatus::Skipped(SkipReason::UpstreamFailure))
        )
    })
}

fn provisioning_error(stage: StageName, error: ExternalError) -> DeployError {
    DeployError::ProvisioningError {
        stage: stage.as_str().to_string(),
        transient: error.is_transient(),
        reason: match error {
            ExternalError::Transient(r) | ExternalError::Permanent(r) => r,
        },
    }
}

fn changed_step(
    stage: StageName,
    success: bool,
    changed: bool,
    error: Option<String>,
) -> tierline_core::Result<Step> {
    if !success {
        return Err(DeployError::ProvisioningError {
            stage: stage.as_str().to_string(),
            reason: error.unwrap_or_else(|| "reported failure".to_string()),
            transient: false,
        });
    }
    Ok(if changed { Step::Succeeded } else { Step::NoChanges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierline_core::fakes::{FakeCheck, FakeContentStore, FakeProvisioningEngine};
    use tierline_core::{Tier, TriggerDescriptor, TriggerType};

    fn timeouts() -> TimeoutConfig {
        TimeoutConfig {
            retry_backoff_ms: 10,
            convergence_initial_backoff_ms: 5,
            convergence_max_backoff_ms: 20,
            ..TimeoutConfig::default()
        }
    }

    fn run_for(env: &str, revision: &str) -> PipelineRun {
        let request = DeploymentRequest::new(
            TriggerDescriptor::of(TriggerType::MainPush),
            "refs/heads/main",
            "ci",
        );
        PipelineRun::new(
            request,
            Environment::new(env, Tier::Staging),
            Operation::Deploy,
            Artifact::revision(revision),
            ExecutionPlan::full(),
        )
    }

    fn executor(
        provisioner: Arc<FakeProvisioningEngine>,
        content: Arc<FakeContentStore>,
        checks: StageChecks,
    ) -> StageExecutor {
        StageExecutor::new(
            provisioner,
            content,
            checks,
            Arc::new(EnvironmentLocks::new()),
            timeouts(),
        )
    }

    #[tokio::test]
    async fn test_full_graph_deploys() {
        let exec = executor(
            Arc::new(FakeProvisioningEngine::new()),
            Arc::new(FakeContentStore::new()),
            StageChecks::new(),
        );
        let run = exec.execute(run_for("staging", "abc123"), &CancelToken::new()).await;
        assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
        assert!(run
            .stages()
            .iter()
            .all(|s| s.status == StageStatus::Succeeded));
        assert!(run.lock_window().is_some());
        assert!(run.is_terminal());
    }

    #[tokio::test]
    async fn test_failed_validation_skips_downstream() {
        let provisioner = Arc::new(FakeProvisioningEngine::new());
        let checks = StageChecks::new()
            .with_check(StageName::TestValidate, Arc::new(FakeCheck::failing("unit")));
        let exec = executor(provisioner.clone(), Arc::new(FakeContentStore::new()), checks);
        let run = exec.execute(run_for("staging", "abc123"), &CancelToken::new()).await;

        assert_eq!(run.outcome(), Some(RunOutcome::Failed));
        assert_eq!(run.code(), "stage_validation_failure");
        assert_eq!(
            run.stage_status(StageName::InfraApply),
            Some(StageStatus::Skipped(SkipReason::UpstreamFailure))
        );
        assert_eq!(
            run.stage_status(StageName::PostDeployValidate),
            Some(StageStatus::Skipped(SkipReason::UpstreamFailure))
        );
        assert!(provisioner.apply_calls().is_empty());
        assert_eq!(run.stage(StageName::TestValidate).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_permanent_apply_failure_is_not_retried() {
        let provisioner = Arc::new(FakeProvisioningEngine::new().failing());
        let exec = executor(
            provisioner.clone(),
            Arc::new(FakeContentStore::new()),
            StageChecks::new(),
        );
        let run = exec.execute(run_for("staging", "abc123"), &CancelToken::new()).await;
        assert_eq!(run.outcome(), Some(RunOutcome::Failed));
        assert_eq!(run.code(), "provisioning_error");
        assert_eq!(provisioner.apply_calls().len(), 1);
        assert!(run.lock_window().is_some());
    }

    #[test]
    fn test_outcome_precedence() {
        let mut run = run_for("staging", "abc123");
        for stage in StageName::ALL {
            run.record_mut(stage).unwrap().status = StageStatus::Skipped(SkipReason::NoChanges);
        }
        assert_eq!(compute_outcome(&run).0, RunOutcome::NoChangesDetected);

        run.record_mut(StageName::ContentDeploy).unwrap().status = StageStatus::Succeeded;
        assert_eq!(compute_outcome(&run).0, RunOutcome::Deployed);

        run.record_mut(StageName::BuildValidate).unwrap().status = StageStatus::Failed;
        assert_eq!(compute_outcome(&run).0, RunOutcome::Failed);

        let mut excluded = run_for("staging", "abc123");
        for stage in StageName::ALL {
            excluded.record_mut(stage).unwrap().status = StageStatus::Skipped(SkipReason::Excluded);
        }
        assert_eq!(compute_outcome(&excluded).0, RunOutcome::ConditionsNotMet);
    }

    #[test]
    fn test_cancel_after_a_changing_stage_is_still_deployed() {
        let mut run = run_for("prod", "abc123");
        for stage in [StageName::BuildValidate, StageName::TestValidate] {
            run.record_mut(stage).unwrap().status = StageStatus::Succeeded;
        }
        run.record_mut(StageName::InfraApply).unwrap().status = StageStatus::Succeeded;
        run.record_mut(StageName::PostInfraValidate).unwrap().status = StageStatus::Succeeded;
        for stage in [StageName::ContentDeploy, StageName::PostDeployValidate] {
            run.record_mut(stage).unwrap().status = StageStatus::Skipped(SkipReason::Cancelled);
        }
        let (outcome, code, reason) = compute_outcome(&run);
        assert_eq!(outcome, RunOutcome::Deployed);
        assert_eq!(code, "deployed");
        assert!(reason.contains("cancelled before content-deploy"));

        run.record_mut(StageName::InfraApply).unwrap().status =
            StageStatus::Skipped(SkipReason::NoChanges);
        assert_eq!(compute_outcome(&run).0, RunOutcome::Cancelled);
    }

    #[test]
    fn test_rejected_run_ignores_late_stage_updates() {
        let mut run = run_for("prod", "abc123");
        run.stages.clear();
        assert!(run.record_mut(StageName::InfraApply).is_none());
        run.set_status(StageName::InfraApply, StageStatus::Running);
        assert!(run.stages().is_empty());
    }

    #[test]
    fn test_plan_digest_is_deterministic() {
        let artifact = Artifact::revision("abc123");
        let a = compute_plan_digest("prod", &artifact, &ExecutionPlan::full());
        let b = compute_plan_digest("prod", &artifact, &ExecutionPlan::full());
        let c = compute_plan_digest("prod", &artifact, &ExecutionPlan::content_only());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_reject_has_zero_stages() {
        let exec = executor(
            Arc::new(FakeProvisioningEngine::new()),
            Arc::new(FakeContentStore::new()),
            StageChecks::new(),
        );
        let err = DeployError::AuthorizationDenied {
            actor: "mike".to_string(),
            environment: "prod".to_string(),
            reason: "not an owner".to_string(),
        };
        let run = exec.reject(run_for("prod", "abc123"), &err);
        assert_eq!(run.outcome(), Some(RunOutcome::Rejected));
        assert_eq!(run.code(), "authorization_denied");
        assert!(run.stages().is_empty());
        assert!(run.to_record().is_some());
    }

    #[test]
    fn test_in_flight_run_has_no_record() {
        let run = run_for("staging", "abc123");
        assert!(!run.is_terminal());
        assert!(run.to_record().is_none());
        assert!(run.summary().is_none());
    }
}
