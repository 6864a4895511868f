//! Conductor: wires the control flow end to end.
//!
//! ```text
//! event → classify → resolve environment → authorize → plan version
//!       → execute stages → record release/outcome → history → status
//! ```
//!
//! Pre-flight refusals (authorization denied, version regression) produce a
//! terminal `Rejected` run with zero stages. Requests that cannot even name
//! an environment fail with an error and produce no run.

use std::sync::Arc;

use chrono::Utc;
use tierline_core::config::PipelineConfig;
use tierline_core::obs;
use tierline_core::{
    Artifact, AuthorizationDecision, AuthorizationGate, AuthorizationSource, CommandContentStore,
    CommandProvisioningEngine, ContentStore, DeployError, DeploymentRequest, Environment,
    LogNotifier, NotificationSink, Operation, PlanReport, PlannedVersion, ProvisioningEngine,
    RawEvent, RegistryAuthorizationSource, ReleaseTag, Result, Tier, TriggerClassifier,
    TriggerDescriptor, TriggerType, Version, VersionManager, VersionRequest, WebhookNotifier,
};
use tierline_state::fakes::{
    MemoryAuthorizationAudit, MemoryReleaseRegistry, MemoryRollbackLog, MemoryRunHistory,
    MemoryStatusBoard,
};
use tierline_state::{
    AuthorizationAudit, ReleaseKind, ReleaseOutcomeRecord, ReleaseRecord, ReleaseRegistry,
    RollbackLog, RollbackStrategy, RunHistory, RunId, RunOutcome, StatusBoard, SurrealHandle,
    SurrealStateStore,
};
use tracing::Instrument;

use crate::cancel::CancelToken;
use crate::executor::{compute_plan_digest, PipelineRun, StageChecks, StageExecutor};
use crate::lock::{EnvironmentLocks, ReleaseSequencer};
use crate::rollback::{RollbackEngine, RollbackReport, RollbackRequest};
use crate::stage::{ExecutionPlan, StageName};
use crate::status::StatusReporter;

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Every persisted store the pipeline writes to.
#[derive(Clone)]
pub struct StateStores {
    pub runs: Arc<dyn RunHistory>,
    pub releases: Arc<dyn ReleaseRegistry>,
    pub rollbacks: Arc<dyn RollbackLog>,
    pub audit: Arc<dyn AuthorizationAudit>,
    pub status: Arc<dyn StatusBoard>,
}

impl StateStores {
    pub fn in_memory() -> Self {
        Self {
            runs: Arc::new(MemoryRunHistory::new()),
            releases: Arc::new(MemoryReleaseRegistry::new()),
            rollbacks: Arc::new(MemoryRollbackLog::new()),
            audit: Arc::new(MemoryAuthorizationAudit::new()),
            status: Arc::new(MemoryStatusBoard::new()),
        }
    }

    pub fn surreal(handle: Arc<SurrealHandle>) -> Self {
        let store = Arc::new(SurrealStateStore::new(handle));
        Self {
            runs: store.clone(),
            releases: store.clone(),
            rollbacks: store.clone(),
            audit: store.clone(),
            status: store,
        }
    }
}

/// External systems the pipeline drives.
pub struct Collaborators {
    pub provisioner: Arc<dyn ProvisioningEngine>,
    pub content: Arc<dyn ContentStore>,
    pub auth_source: Arc<dyn AuthorizationSource>,
    pub checks: StageChecks,
    pub notifiers: Vec<Arc<dyn NotificationSink>>,
}

/// How a handled event ended.
#[derive(Debug, Clone)]
pub enum Completion {
    Deployment(PipelineRun),
    Rollback(RollbackReport),
}

impl Completion {
    pub fn outcome(&self) -> RunOutcome {
        match self {
            Completion::Deployment(run) => run.outcome().unwrap_or(RunOutcome::ConditionsNotMet),
            Completion::Rollback(report) => report.outcome(),
        }
    }

    pub fn run(&self) -> Option<&PipelineRun> {
        match self {
            Completion::Deployment(run) => Some(run),
            Completion::Rollback(report) => report.run.as_ref(),
        }
    }
}

/// What a request would do, computed without side effects.
#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub environment: String,
    pub operation: Operation,
    pub decision: AuthorizationDecision,
    /// The version the run would ship; for a rollback, its rollback tag.
    pub planned_version: Option<Version>,
    /// Why version planning (or rollback target resolution) refused the
    /// request, if it did.
    pub version_error: Option<String>,
    /// Release a rollback would return to.
    pub rollback_target: Option<Version>,
    pub stages: Vec<StageName>,
    pub plan_digest: String,
    pub provisioning_plan: Option<PlanReport>,
}

impl DryRunReport {
    pub fn would_proceed(&self) -> bool {
        self.decision.allowed && self.version_error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Conductor
// ---------------------------------------------------------------------------

pub struct Conductor {
    config: PipelineConfig,
    classifier: TriggerClassifier,
    gate: AuthorizationGate,
    versions: Arc<VersionManager>,
    executor: StageExecutor,
    sequencer: ReleaseSequencer,
    rollbacks: RollbackEngine,
    reporter: StatusReporter,
    stores: StateStores,
}

impl Conductor {
    pub fn new(
        config: PipelineConfig,
        stores: StateStores,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let classifier = TriggerClassifier::new(&config.main_branch, &config.tag_prefix)?;
        let gate = AuthorizationGate::new(collaborators.auth_source, stores.audit.clone())
            .with_owners(config.authorization.owners.iter().cloned())
            .with_min_reason_len(config.authorization.min_reason_len);
        let versions = Arc::new(VersionManager::new());
        let executor = StageExecutor::new(
            collaborators.provisioner,
            collaborators.content,
            collaborators.checks,
            Arc::new(EnvironmentLocks::new()),
            config.timeouts.clone(),
        );
        let rollbacks = RollbackEngine::new(
            stores.releases.clone(),
            stores.rollbacks.clone(),
            versions.clone(),
        );
        let reporter = collaborators
            .notifiers
            .into_iter()
            .fold(StatusReporter::new(stores.status.clone()), |r, sink| {
                r.with_sink(sink)
            });

        Ok(Self {
            config,
            classifier,
            gate,
            versions,
            executor,
            sequencer: ReleaseSequencer::new(),
            rollbacks,
            reporter,
            stores,
        })
    }

    /// Command-backed collaborators, registry authorization and
    /// log/webhook notification, all from configuration.
    pub fn from_config(config: PipelineConfig, stores: StateStores) -> Result<Self> {
        let provisioning = config.provisioning.as_ref().ok_or_else(|| {
            DeployError::Config("no provisioning commands configured".to_string())
        })?;
        let content = config
            .content
            .as_ref()
            .ok_or_else(|| DeployError::Config("no content sync command configured".to_string()))?;

        let mut provisioner = CommandProvisioningEngine::new(provisioning.apply.clone());
        if let Some(plan) = &provisioning.plan {
            provisioner = provisioner.with_plan(plan.clone());
        }
        if let Some(converge) = &provisioning.converge {
            provisioner = provisioner.with_converge(converge.clone());
        }

        let mut notifiers: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = &config.notify.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(url)?));
        }

        let collaborators = Collaborators {
            provisioner: Arc::new(provisioner),
            content: Arc::new(CommandContentStore::new(content.sync.clone())),
            auth_source: Arc::new(RegistryAuthorizationSource::new(
                config.authorization.registry()?,
            )),
            checks: StageChecks::from_config(&config.checks),
            notifiers,
        };
        Self::new(config, stores, collaborators)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stores(&self) -> &StateStores {
        &self.stores
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    pub fn classifier(&self) -> &TriggerClassifier {
        &self.classifier
    }

    /// Classify an inbound event and run it. A pushed rollback tag goes
    /// through the rollback engine for the tag's core version.
    pub async fn handle_event(&self, event: &RawEvent, cancel: &CancelToken) -> Result<Completion> {
        let request = self.classifier.request_from(event)?;

        if request.operation() == Operation::Rollback {
            let environment = self.resolve(&request)?;
            let tag = request.trigger.tag.as_ref().map(|t| t.version.clone());
            let mut rollback = RollbackRequest::new(
                &environment.name,
                RollbackStrategy::SpecificRevision,
                &request.actor,
            );
            if let Some(tag) = tag {
                rollback = rollback.with_revision(&tag.core().to_string()).with_tag(tag);
            }
            rollback.reason = request.reason.clone();
            return Ok(Completion::Rollback(self.rollback(rollback, cancel).await?));
        }

        Ok(Completion::Deployment(self.submit(request, cancel).await?))
    }

    /// Run a deployment request to a terminal outcome.
    pub async fn submit(
        &self,
        request: DeploymentRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineRun> {
        let operation = request.operation();
        if operation == Operation::Rollback {
            return Err(DeployError::MalformedEvent(
                "rollback tags must go through the rollback entry point".to_string(),
            ));
        }
        let environment = self.resolve(&request)?;
        let run_id = RunId::new();
        let span = obs::run_span(&run_id.0, &environment.name);
        self.drive_request(run_id, request, environment, cancel)
            .instrument(span)
            .await
    }

    async fn drive_request(
        &self,
        run_id: RunId,
        request: DeploymentRequest,
        environment: Environment,
        cancel: &CancelToken,
    ) -> Result<PipelineRun> {
        let operation = request.operation();
        let revision = request.source_revision().to_string();
        let decision = self
            .gate
            .authorize(
                &run_id,
                &request.actor,
                &environment,
                operation,
                request.reason.as_deref(),
            )
            .await?;

        if let Err(denied) = decision.require_allowed() {
            let run = PipelineRun::new(
                request,
                environment,
                operation,
                Artifact::revision(&revision),
                ExecutionPlan::full(),
            )
            .with_run_id(run_id);
            return self.finish_rejected(run, &denied).await;
        }

        let (version_request, implicit) = Self::version_request_for(&request, &environment);

        // Held until the release is recorded, so concurrent versioned runs
        // plan against each other's releases.
        let _turn = match &version_request {
            Some(_) => match self.sequencer.enter(&environment.name, cancel).await {
                Some(turn) => Some(turn),
                None => {
                    let plan = ExecutionPlan::full().for_environment(&environment);
                    let run = PipelineRun::new(
                        request,
                        environment,
                        operation,
                        Artifact::revision(&revision),
                        plan,
                    )
                    .with_run_id(run_id);
                    let run = self.executor.execute(run, cancel).await;
                    self.persist(&run).await?;
                    return Ok(run);
                }
            },
            None => None,
        };

        let planned = match &version_request {
            Some(vr) => match self.plan_version(vr, &environment).await {
                Ok(planned) => Some(planned),
                Err(e @ DeployError::VersionRegression { .. }) => {
                    let run = PipelineRun::new(
                        request,
                        environment,
                        operation,
                        Artifact::revision(&revision),
                        ExecutionPlan::full(),
                    )
                    .with_run_id(run_id);
                    return self.finish_rejected(run, &e).await;
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let artifact = match &planned {
            Some(p) => Artifact::release(p.version.clone(), &revision),
            None => Artifact::revision(&revision),
        };
        let plan = ExecutionPlan::full().for_environment(&environment);
        let mut run =
            PipelineRun::new(request, environment, operation, artifact, plan).with_run_id(run_id);
        if let Some(p) = &planned {
            run = run.with_release_kind(p.kind);
            if !implicit {
                self.record_release(&run, &p.version, p.kind, &revision)
                    .await?;
            }
        }

        let run = self.executor.execute(run, cancel).await;

        if let Some(p) = &planned {
            let deployed = run.outcome() == Some(RunOutcome::Deployed);
            if !implicit {
                self.record_outcome(&run, &p.version).await?;
            } else if deployed {
                // Implicit releases only exist once they have shipped.
                match self.record_release(&run, &p.version, p.kind, &revision).await {
                    Ok(()) => self.record_outcome(&run, &p.version).await?,
                    Err(e) => obs::emit_side_effect_error(&run.run_id().0, "release", &e),
                }
            }
        }

        self.persist(&run).await?;
        Ok(run)
    }

    /// Authorize under the owners policy, resolve the target, run it and
    /// write the rollback record. Nothing is read from the release lineage
    /// until the actor is allowed.
    pub async fn rollback(
        &self,
        request: RollbackRequest,
        cancel: &CancelToken,
    ) -> Result<RollbackReport> {
        let environment = self.rollback_environment(&request)?;
        let run_id = RunId::new();

        let decision = self
            .gate
            .authorize(
                &run_id,
                &request.actor,
                &environment,
                Operation::Rollback,
                request.reason.as_deref(),
            )
            .await?;
        if let Err(denied) = decision.require_allowed() {
            let reference = request.target_reference();
            let deployment = self.rollback_deployment(&request, &reference, &environment);
            let run = PipelineRun::new(
                deployment,
                environment,
                Operation::Rollback,
                Artifact::revision(&reference),
                ExecutionPlan::full(),
            )
            .with_run_id(run_id.clone())
            .with_release_kind(ReleaseKind::Rollback);
            let run = self.finish_rejected(run, &denied).await?;
            let record = self
                .rollbacks
                .record(&request, None, RunOutcome::Rejected, denied.code(), Some(&run_id))
                .await?;
            return Ok(RollbackReport {
                record,
                run: Some(run),
            });
        }

        let Some(_turn) = self.sequencer.enter(&environment.name, cancel).await else {
            let record = self
                .rollbacks
                .record(&request, None, RunOutcome::Cancelled, "cancelled", None)
                .await?;
            return Ok(RollbackReport { record, run: None });
        };

        let target = match self.rollbacks.resolve(&request, Utc::now()).await {
            Ok(target) => target,
            Err(e @ DeployError::RollbackTargetNotFound(_)) => {
                tracing::warn!(
                    environment = %environment.name,
                    error = %e,
                    "rollback target not found"
                );
                let record = self
                    .rollbacks
                    .record(&request, None, RunOutcome::Failed, e.code(), None)
                    .await?;
                return Ok(RollbackReport { record, run: None });
            }
            Err(e) => return Err(e),
        };

        let revision = target.release.source_revision.clone();
        let deployment = self
            .rollback_deployment(&request, &target.tag.to_string(), &environment)
            .with_revision(&revision);
        let plan = target.plan.clone().for_environment(&environment);
        let artifact = Artifact::release(target.version.clone(), &revision);
        let run = PipelineRun::new(deployment, environment, Operation::Rollback, artifact, plan)
            .with_run_id(run_id.clone())
            .with_release_kind(ReleaseKind::Rollback);

        self.record_release(&run, &target.tag, ReleaseKind::Rollback, &revision)
            .await?;
        let run = self.executor.execute(run, cancel).await;
        self.record_outcome(&run, &target.tag).await?;
        self.persist(&run).await?;

        let outcome = run.outcome().unwrap_or(RunOutcome::ConditionsNotMet);
        let record = self
            .rollbacks
            .record(&request, Some(&target), outcome, run.code(), Some(&run_id))
            .await?;
        Ok(RollbackReport {
            record,
            run: Some(run),
        })
    }

    /// Evaluate a rollback without side effects: authorization (not
    /// audited), target resolution, the rollback tag and the provisioning
    /// plan. Nothing is persisted and no stage runs.
    pub async fn dry_run_rollback(&self, request: &RollbackRequest) -> Result<DryRunReport> {
        let environment = self.rollback_environment(request)?;
        let decision = self
            .gate
            .evaluate(
                &request.actor,
                &environment,
                Operation::Rollback,
                request.reason.as_deref(),
            )
            .await;

        // Lineage is only consulted for actors the gate would let through.
        let (target, version_error) = if decision.allowed {
            match self.rollbacks.resolve(request, Utc::now()).await {
                Ok(target) => (Some(target), None),
                Err(e @ DeployError::RollbackTargetNotFound(_)) => (None, Some(e.to_string())),
                Err(e) => return Err(e),
            }
        } else {
            (None, None)
        };

        let (artifact, plan) = match &target {
            Some(t) => (
                Artifact::release(t.version.clone(), &t.release.source_revision),
                t.plan.clone().for_environment(&environment),
            ),
            None => (
                Artifact::revision(&request.target_reference()),
                ExecutionPlan::full().for_environment(&environment),
            ),
        };
        let provisioning_plan = match &target {
            Some(_) if plan.includes(StageName::InfraApply) => {
                Some(self.provisioning_plan(&environment, &artifact).await?)
            }
            _ => None,
        };

        Ok(DryRunReport {
            plan_digest: compute_plan_digest(&environment.name, &artifact, &plan),
            environment: environment.name,
            operation: Operation::Rollback,
            decision,
            planned_version: target.as_ref().map(|t| t.tag.clone()),
            version_error,
            rollback_target: target.map(|t| t.version),
            stages: plan.stages(),
            provisioning_plan,
        })
    }

    /// Classify, resolve, authorize, plan the version and ask the
    /// provisioning engine for a plan. Persists nothing and runs no stage.
    pub async fn dry_run(&self, request: &DeploymentRequest) -> Result<DryRunReport> {
        let environment = self.resolve(request)?;
        let operation = request.operation();
        let decision = self
            .gate
            .evaluate(&request.actor, &environment, operation, request.reason.as_deref())
            .await;

        let (version_request, _) = Self::version_request_for(request, &environment);
        let (planned_version, version_error) = match &version_request {
            Some(vr) => match self.plan_version(vr, &environment).await {
                Ok(planned) => (Some(planned.version), None),
                Err(e @ DeployError::VersionRegression { .. }) => (None, Some(e.to_string())),
                Err(e) => return Err(e),
            },
            None => (None, None),
        };

        let revision = request.source_revision();
        let artifact = match &planned_version {
            Some(v) => Artifact::release(v.clone(), revision),
            None => Artifact::revision(revision),
        };
        let plan = ExecutionPlan::full().for_environment(&environment);
        let provisioning_plan = if plan.includes(StageName::InfraApply) {
            Some(self.provisioning_plan(&environment, &artifact).await?)
        } else {
            None
        };

        Ok(DryRunReport {
            plan_digest: compute_plan_digest(&environment.name, &artifact, &plan),
            environment: environment.name,
            operation,
            decision,
            planned_version,
            version_error,
            rollback_target: None,
            stages: plan.stages(),
            provisioning_plan,
        })
    }

    // -- helpers --

    fn rollback_environment(&self, request: &RollbackRequest) -> Result<Environment> {
        self.config
            .environments
            .get(&request.environment)
            .cloned()
            .ok_or_else(|| {
                DeployError::InvalidEnvironment(format!(
                    "'{}' is not configured (known: {})",
                    request.environment,
                    self.config.environments.names().join(", ")
                ))
            })
    }

    /// The deployment request a rollback run carries. A pushed rollback tag
    /// keeps its tag trigger; everything else is a manual dispatch.
    fn rollback_deployment(
        &self,
        request: &RollbackRequest,
        source_ref: &str,
        environment: &Environment,
    ) -> DeploymentRequest {
        let trigger = match &request.tag {
            Some(tag) => TriggerDescriptor {
                trigger_type: TriggerType::ReleaseTag,
                branch: None,
                tag: Some(ReleaseTag {
                    tag: format!("{}{}", self.config.tag_prefix, tag),
                    version: tag.clone(),
                    kind: ReleaseKind::Rollback,
                }),
            },
            None => TriggerDescriptor::of(TriggerType::ManualDispatch),
        };
        let mut deployment = DeploymentRequest::new(trigger, source_ref, &request.actor)
            .with_environment(&environment.name);
        deployment.reason = request.reason.clone();
        deployment
    }

    async fn provisioning_plan(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> Result<PlanReport> {
        self.executor
            .provisioner()
            .plan(environment, artifact)
            .await
            .map_err(|e| DeployError::ProvisioningError {
                stage: "plan".to_string(),
                transient: e.is_transient(),
                reason: e.to_string(),
            })
    }

    fn resolve(&self, request: &DeploymentRequest) -> Result<Environment> {
        tierline_core::resolve_environment(
            request.trigger_type(),
            request.explicit_environment.as_deref(),
            &self.config.environments,
            self.config.fallback_environment.as_deref(),
        )
        .cloned()
    }

    /// Version request in force, and whether it is the implicit prod patch.
    fn version_request_for(
        request: &DeploymentRequest,
        environment: &Environment,
    ) -> (Option<VersionRequest>, bool) {
        match request.version_request() {
            Some(vr) => (Some(vr), false),
            None if environment.tier == Tier::Prod => (Some(VersionRequest::Patch), true),
            None => (None, false),
        }
    }

    async fn plan_version(
        &self,
        request: &VersionRequest,
        environment: &Environment,
    ) -> Result<PlannedVersion> {
        let lineage = self.stores.releases.releases(&environment.name).await?;
        self.versions.next(request, &lineage, Utc::now())
    }

    async fn record_release(
        &self,
        run: &PipelineRun,
        version: &Version,
        kind: ReleaseKind,
        revision: &str,
    ) -> Result<()> {
        self.stores
            .releases
            .record_release(&ReleaseRecord {
                environment: run.environment().name.clone(),
                version: version.to_string(),
                kind,
                source_revision: revision.to_string(),
                created_by: run.request().actor.clone(),
                run_id: run.run_id().clone(),
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn record_outcome(&self, run: &PipelineRun, version: &Version) -> Result<()> {
        let Some(outcome) = run.outcome() else {
            return Ok(());
        };
        self.stores
            .releases
            .record_outcome(&ReleaseOutcomeRecord {
                environment: run.environment().name.clone(),
                version: version.to_string(),
                outcome,
                run_id: run.run_id().clone(),
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn finish_rejected(&self, run: PipelineRun, error: &DeployError) -> Result<PipelineRun> {
        tracing::info!(code = error.code(), reason = %error, "run rejected before any stage");
        let run = self.executor.reject(run, error);
        self.persist(&run).await?;
        Ok(run)
    }

    /// Append to history, then publish status and notify.
    async fn persist(&self, run: &PipelineRun) -> Result<()> {
        if let Some(record) = run.to_record() {
            self.stores.runs.record_run(&record).await?;
        }
        self.reporter.report(run).await?;
        Ok(())
    }
}
