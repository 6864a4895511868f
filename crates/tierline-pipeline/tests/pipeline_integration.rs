//! End-to-end pipeline behaviour against in-memory stores and fake
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tierline_core::config::PipelineConfig;
use tierline_core::fakes::{
    ConcurrencyGauge, FakeCheck, FakeContentStore, FakeProvisioningEngine, RecordingNotifier,
    StaticAuthorizationSource,
};
use tierline_core::{
    DeploymentRequest, Environment, EnvironmentSet, Operation, RawEvent, Role, Tier,
    TriggerDescriptor, TriggerType, VersionRequest,
};
use tierline_pipeline::{
    CancelToken, Collaborators, Completion, Conductor, PipelineRun, RollbackRequest, StageChecks,
    StageName, StateStores,
};
use tierline_state::{
    AuthorizationAudit, ReleaseKind, ReleaseOutcomeRecord, ReleaseRecord, ReleaseRegistry,
    RollbackLog, RollbackStrategy, RunHistory, RunId, RunOutcome, SkipReason, StageStatus,
    StatusBoard,
};

struct Harness {
    conductor: Conductor,
    stores: StateStores,
    provisioner: Arc<FakeProvisioningEngine>,
    content: Arc<FakeContentStore>,
    notifier: Arc<RecordingNotifier>,
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.authorization.owners = vec!["rita".to_string()];
    config.timeouts.retry_backoff_ms = 10;
    config.timeouts.convergence_initial_backoff_ms = 5;
    config.timeouts.convergence_max_backoff_ms = 20;
    config
}

fn harness() -> Harness {
    build(
        config(),
        FakeProvisioningEngine::new(),
        FakeContentStore::new(),
        StageChecks::new(),
    )
}

fn build(
    config: PipelineConfig,
    provisioner: FakeProvisioningEngine,
    content: FakeContentStore,
    checks: StageChecks,
) -> Harness {
    let stores = StateStores::in_memory();
    let provisioner = Arc::new(provisioner);
    let content = Arc::new(content);
    let notifier = Arc::new(RecordingNotifier::new());
    let source = StaticAuthorizationSource::new()
        .with_actor("rita", Role::Member)
        .with_actor("mike", Role::Member);

    let conductor = Conductor::new(
        config,
        stores.clone(),
        Collaborators {
            provisioner: provisioner.clone(),
            content: content.clone(),
            auth_source: Arc::new(source),
            checks,
            notifiers: vec![notifier.clone()],
        },
    )
    .expect("conductor");

    Harness {
        conductor,
        stores,
        provisioner,
        content,
        notifier,
    }
}

fn push(git_ref: &str, actor: &str, sha: &str) -> RawEvent {
    let mut event = RawEvent::new("push", git_ref, actor);
    event.payload = serde_json::json!({ "after": sha });
    event
}

fn main_push(sha: &str) -> DeploymentRequest {
    DeploymentRequest::new(TriggerDescriptor::of(TriggerType::MainPush), "refs/heads/main", "mike")
        .with_revision(sha)
}

async fn deployment(h: &Harness, event: &RawEvent) -> PipelineRun {
    match h
        .conductor
        .handle_event(event, &CancelToken::new())
        .await
        .expect("event handled")
    {
        Completion::Deployment(run) => run,
        Completion::Rollback(report) => panic!("unexpected rollback: {:?}", report.record),
    }
}

async fn seed_release(h: &Harness, environment: &str, version: &str, outcome: RunOutcome) {
    let run_id = RunId::new();
    h.stores
        .releases
        .record_release(&ReleaseRecord {
            environment: environment.to_string(),
            version: version.to_string(),
            kind: ReleaseKind::Standard,
            source_revision: format!("sha-{}", version),
            created_by: "rita".to_string(),
            run_id: run_id.clone(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    h.stores
        .releases
        .record_outcome(&ReleaseOutcomeRecord {
            environment: environment.to_string(),
            version: version.to_string(),
            outcome,
            run_id,
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();
}

fn all_stages(run: &PipelineRun, status: StageStatus) -> bool {
    run.stages().len() == StageName::ALL.len() && run.stages().iter().all(|s| s.status == status)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn main_push_deploys_to_staging() {
    let h = harness();
    let run = deployment(&h, &push("refs/heads/main", "mike", "9f3c2e1")).await;

    assert_eq!(run.environment().name, "staging");
    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert!(all_stages(&run, StageStatus::Succeeded));
    assert_eq!(run.artifact().revision, "9f3c2e1");
    assert!(run.artifact().version.is_none(), "staging deploys cut no release");
    assert_eq!(h.provisioner.live("staging").as_deref(), Some("9f3c2e1"));
    assert_eq!(h.content.live("staging").as_deref(), Some("9f3c2e1"));

    let history = h.stores.runs.list_runs(Some("staging")).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, RunOutcome::Deployed);
    let status = h.stores.status.current("staging").await.unwrap().unwrap();
    assert_eq!(&status.triggering_run_id, run.run_id());
    assert_eq!(h.notifier.summaries().len(), 1);
}

#[tokio::test]
async fn release_tag_by_non_owner_is_rejected_with_zero_stages() {
    let h = harness();
    let run = deployment(&h, &push("refs/tags/v1.3.0", "mike", "abc")).await;

    assert_eq!(run.environment().name, "prod");
    assert_eq!(run.outcome(), Some(RunOutcome::Rejected));
    assert_eq!(run.code(), "authorization_denied");
    assert!(run.stages().is_empty());
    assert!(h.provisioner.calls().is_empty());
    assert!(h.content.calls().is_empty());

    let audit = h.stores.audit.list(Some("prod")).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert!(!audit[0].allowed);
    assert!(h.stores.releases.releases("prod").await.unwrap().is_empty());
    let status = h.stores.status.current("prod").await.unwrap().unwrap();
    assert_eq!(status.outcome, RunOutcome::Rejected);
}

#[tokio::test]
async fn last_known_good_rollback_returns_to_previous_release() {
    let h = harness();
    seed_release(&h, "prod", "1.2.0", RunOutcome::Deployed).await;
    seed_release(&h, "prod", "1.3.0", RunOutcome::Failed).await;
    h.provisioner.mark_applied("prod", "1.3.0");
    h.content.mark_synced("prod", "1.3.0");

    let request = RollbackRequest::new("prod", RollbackStrategy::LastKnownGood, "rita")
        .with_reason("1.3.0 breaks checkout");
    let report = h
        .conductor
        .rollback(request, &CancelToken::new())
        .await
        .unwrap();

    let run = report.run.as_ref().expect("rollback run");
    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(run.operation(), Operation::Rollback);
    assert_eq!(run.stage_status(StageName::InfraApply), Some(StageStatus::Succeeded));
    assert_eq!(run.stage_status(StageName::ContentDeploy), Some(StageStatus::Succeeded));
    assert_eq!(h.provisioner.live("prod").as_deref(), Some("1.2.0"));
    assert_eq!(h.content.live("prod").as_deref(), Some("1.2.0"));

    assert_eq!(report.record.target_version.as_deref(), Some("1.2.0"));
    assert_eq!(report.record.outcome, RunOutcome::Deployed);
    let tag = report.record.rollback_tag.clone().unwrap();
    assert!(tag.starts_with("1.2.0-rollback."));

    let log = h.stores.rollbacks.list(Some("prod")).await.unwrap();
    assert_eq!(log, vec![report.record.clone()]);
    let lineage = h.stores.releases.releases("prod").await.unwrap();
    assert_eq!(lineage[0].version, tag);
    assert_eq!(lineage[0].kind, ReleaseKind::Rollback);
    assert_eq!(lineage[0].source_revision, "sha-1.2.0");
}

#[tokio::test]
async fn concurrent_runs_on_one_environment_never_share_the_lock() {
    let h = build(
        config(),
        FakeProvisioningEngine::new().with_apply_delay(Duration::from_millis(60)),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let cancel = CancelToken::new();
    let (first, second) = tokio::join!(
        h.conductor.submit(main_push("sha-a"), &cancel),
        h.conductor.submit(main_push("sha-b"), &cancel),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(second.outcome(), Some(RunOutcome::Deployed));
    let a = first.lock_window().unwrap();
    let b = second.lock_window().unwrap();
    assert!(!a.overlaps(b), "lock windows overlap: {:?} {:?}", a, b);

    let applies = h.provisioner.apply_calls();
    assert_eq!(applies.len(), 2);
    assert!(applies[0].finished_at <= applies[1].started_at);
}

#[tokio::test]
async fn runs_on_different_environments_proceed_in_parallel() {
    let h = build(
        config(),
        FakeProvisioningEngine::new().with_apply_delay(Duration::from_millis(80)),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let cancel = CancelToken::new();
    let dev = main_push("sha-a").with_environment("dev");
    let (staging, dev) = tokio::join!(
        h.conductor.submit(main_push("sha-a"), &cancel),
        h.conductor.submit(dev, &cancel),
    );
    let a = staging.unwrap().lock_window().cloned().unwrap();
    let b = dev.unwrap().lock_window().cloned().unwrap();
    assert!(a.overlaps(&b));
}

// ---------------------------------------------------------------------------
// Outcomes and retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rerunning_an_applied_revision_detects_no_changes() {
    let h = harness();
    let first = h
        .conductor
        .submit(main_push("9f3c2e1"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(first.outcome(), Some(RunOutcome::Deployed));

    let rerun = h
        .conductor
        .submit(main_push("9f3c2e1"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.outcome(), Some(RunOutcome::NoChangesDetected));
    assert_eq!(rerun.code(), "no_changes_detected");
    assert_eq!(
        rerun.stage_status(StageName::InfraApply),
        Some(StageStatus::Skipped(SkipReason::NoChanges))
    );
    assert_eq!(
        rerun.stage_status(StageName::ContentDeploy),
        Some(StageStatus::Skipped(SkipReason::NoChanges))
    );
    assert_eq!(first.plan_digest(), rerun.plan_digest());
}

#[tokio::test]
async fn transient_apply_error_is_retried_once() {
    let h = build(
        config(),
        FakeProvisioningEngine::new().with_transient_failures(1),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let run = h
        .conductor
        .submit(main_push("sha-a"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(run.stage(StageName::InfraApply).unwrap().attempts, 2);
    assert_eq!(h.provisioner.apply_calls().len(), 2);
}

#[tokio::test]
async fn second_transient_error_fails_the_run() {
    let h = build(
        config(),
        FakeProvisioningEngine::new().with_transient_failures(2),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let run = h
        .conductor
        .submit(main_push("sha-a"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Failed));
    assert_eq!(run.code(), "provisioning_error");
    assert_eq!(h.provisioner.apply_calls().len(), 2);
    assert_eq!(
        run.stage_status(StageName::ContentDeploy),
        Some(StageStatus::Skipped(SkipReason::UpstreamFailure))
    );
    assert!(h.content.calls().is_empty());
}

#[tokio::test]
async fn failing_validation_is_never_retried() {
    let check = Arc::new(FakeCheck::failing("unit-tests"));
    let h = build(
        config(),
        FakeProvisioningEngine::new(),
        FakeContentStore::new(),
        StageChecks::new().with_check(StageName::TestValidate, check.clone()),
    );
    let run = h
        .conductor
        .submit(main_push("sha-a"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Failed));
    assert_eq!(run.code(), "stage_validation_failure");
    assert!(run.reason().contains("unit-tests"));
    assert_eq!(check.runs(), 1);
    assert!(h.provisioner.apply_calls().is_empty());
}

#[tokio::test]
async fn post_infra_validate_waits_for_convergence() {
    let h = build(
        config(),
        FakeProvisioningEngine::new().with_pending_polls(3),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let run = h
        .conductor
        .submit(main_push("sha-a"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(h.provisioner.polls(), 4);
}

#[tokio::test]
async fn validation_checks_run_concurrently() {
    let gauge = Arc::new(ConcurrencyGauge::default());
    let lint = Arc::new(
        FakeCheck::passing("lint")
            .with_delay(Duration::from_millis(40))
            .with_gauge(gauge.clone()),
    );
    let build_check = Arc::new(
        FakeCheck::passing("build")
            .with_delay(Duration::from_millis(40))
            .with_gauge(gauge.clone()),
    );
    let checks = StageChecks::new()
        .with_check(StageName::BuildValidate, lint.clone())
        .with_check(StageName::BuildValidate, build_check.clone());
    let h = build(config(), FakeProvisioningEngine::new(), FakeContentStore::new(), checks);

    let run = h
        .conductor
        .submit(main_push("sha-a"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(gauge.peak(), 2);
    assert_eq!(lint.runs() + build_check.runs(), 2);
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

fn limited(limit: impl Fn(&mut Environment)) -> PipelineConfig {
    let mut config = config();
    let mut staging = Environment::new("staging", Tier::Staging);
    limit(&mut staging);
    config.environments = EnvironmentSet::new(vec![
        Environment::new("dev", Tier::Dev),
        staging,
        Environment::new("prod", Tier::Prod),
    ]);
    config
}

#[tokio::test(start_paused = true)]
async fn slow_apply_hits_the_stage_timeout() {
    let config = limited(|env| env.resource_limits.infra_apply_timeout_secs = Some(1));
    let h = build(
        config,
        FakeProvisioningEngine::new().with_apply_delay(Duration::from_secs(5)),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let run = h
        .conductor
        .submit(main_push("sha-a"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Failed));
    assert_eq!(run.code(), "stage_timeout");
    assert_eq!(run.stage(StageName::InfraApply).unwrap().attempts, 1);
    assert!(run.lock_window().is_some());
}

#[tokio::test(start_paused = true)]
async fn run_timeout_dominates_stage_timeouts() {
    let config = limited(|env| env.resource_limits.run_timeout_secs = Some(2));
    let h = build(
        config,
        FakeProvisioningEngine::new().with_apply_delay(Duration::from_secs(10)),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let run = h
        .conductor
        .submit(main_push("sha-a"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Failed));
    assert_eq!(run.code(), "run_timeout");
}

#[tokio::test(start_paused = true)]
async fn convergence_timeout_is_retried_once_then_fails() {
    let mut config = config();
    config.timeouts.post_infra_validate_secs = 1;
    let h = build(
        config,
        FakeProvisioningEngine::new().with_pending_polls(u32::MAX),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let run = h
        .conductor
        .submit(main_push("sha-a"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Failed));
    assert_eq!(run.code(), "stage_timeout");
    assert_eq!(run.stage(StageName::PostInfraValidate).unwrap().attempts, 2);
    assert!(h.content.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_before_start_touches_nothing() {
    let h = harness();
    let cancel = CancelToken::new();
    cancel.cancel();
    let run = h.conductor.submit(main_push("sha-a"), &cancel).await.unwrap();

    assert_eq!(run.outcome(), Some(RunOutcome::Cancelled));
    assert!(all_stages(&run, StageStatus::Skipped(SkipReason::Cancelled)));
    assert!(h.provisioner.calls().is_empty());
    let status = h.stores.status.current("staging").await.unwrap().unwrap();
    assert_eq!(status.outcome, RunOutcome::Cancelled);
}

#[tokio::test]
async fn cancel_interrupts_validation_before_infra_apply() {
    let slow = Arc::new(FakeCheck::passing("e2e").with_delay(Duration::from_secs(30)));
    let h = build(
        config(),
        FakeProvisioningEngine::new(),
        FakeContentStore::new(),
        StageChecks::new().with_check(StageName::TestValidate, slow),
    );
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let run = tokio::time::timeout(
        Duration::from_secs(5),
        h.conductor.submit(main_push("sha-a"), &cancel),
    )
    .await
    .expect("cancellation should not wait for the slow check")
    .unwrap();

    assert_eq!(run.outcome(), Some(RunOutcome::Cancelled));
    assert_eq!(run.stage_status(StageName::BuildValidate), Some(StageStatus::Succeeded));
    assert_eq!(
        run.stage_status(StageName::TestValidate),
        Some(StageStatus::Skipped(SkipReason::Cancelled))
    );
    assert!(h.provisioner.apply_calls().is_empty());
}

#[tokio::test]
async fn cancel_during_infra_apply_waits_for_the_lock_window() {
    let h = build(
        config(),
        FakeProvisioningEngine::new().with_apply_delay(Duration::from_millis(100)),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let run = h.conductor.submit(main_push("sha-a"), &cancel).await.unwrap();
    // Infrastructure changed before the cancel took effect.
    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert!(run.reason().contains("cancelled before content-deploy"));
    assert_eq!(run.stage_status(StageName::InfraApply), Some(StageStatus::Succeeded));
    assert_eq!(
        run.stage_status(StageName::PostInfraValidate),
        Some(StageStatus::Succeeded)
    );
    assert_eq!(
        run.stage_status(StageName::ContentDeploy),
        Some(StageStatus::Skipped(SkipReason::Cancelled))
    );
    assert!(h.content.calls().is_empty());
    let status = h.stores.status.current("staging").await.unwrap().unwrap();
    assert_eq!(status.outcome, RunOutcome::Deployed);
}

#[tokio::test]
async fn cancel_after_prod_infra_apply_still_records_the_release() {
    let h = build(
        config(),
        FakeProvisioningEngine::new().with_apply_delay(Duration::from_millis(100)),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    seed_release(&h, "prod", "1.3.0", RunOutcome::Deployed).await;
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let mut request = main_push("sha-a").with_environment("prod");
    request.actor = "rita".to_string();
    let run = h.conductor.submit(request, &cancel).await.unwrap();

    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(h.provisioner.live("prod").as_deref(), Some("1.3.1"));
    let lineage = h.stores.releases.releases("prod").await.unwrap();
    assert_eq!(lineage[0].version, "1.3.1");
    assert_eq!(lineage[0].source_revision, "sha-a");
}

// ---------------------------------------------------------------------------
// Releases and versions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn owner_release_records_release_and_outcome() {
    let h = harness();
    let run = deployment(&h, &push("refs/tags/v1.0.0", "rita", "abc")).await;
    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(run.operation(), Operation::Release);

    let lineage = h.stores.releases.releases("prod").await.unwrap();
    assert_eq!(lineage.len(), 1);
    assert_eq!(lineage[0].version, "1.0.0");
    assert_eq!(lineage[0].source_revision, "abc");
    let outcome = h
        .stores
        .releases
        .last_outcome("prod", "1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.outcome, RunOutcome::Deployed);
}

#[tokio::test]
async fn stale_tag_is_rejected_as_regression() {
    let h = harness();
    seed_release(&h, "prod", "1.3.0", RunOutcome::Deployed).await;
    let run = deployment(&h, &push("refs/tags/v1.2.9", "rita", "abc")).await;

    assert_eq!(run.outcome(), Some(RunOutcome::Rejected));
    assert_eq!(run.code(), "version_regression");
    assert!(run.stages().is_empty());
    assert!(h.provisioner.calls().is_empty());
}

#[tokio::test]
async fn implicit_prod_patch_is_kept_only_when_deployed() {
    let failing = build(
        config(),
        FakeProvisioningEngine::new(),
        FakeContentStore::new().failing(),
        StageChecks::new(),
    );
    let mut request = main_push("sha-a").with_environment("prod");
    request.actor = "rita".to_string();
    let run = failing
        .conductor
        .submit(request.clone(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Failed));
    assert!(failing.stores.releases.releases("prod").await.unwrap().is_empty());

    let h = harness();
    seed_release(&h, "prod", "1.3.0", RunOutcome::Deployed).await;
    let run = h.conductor.submit(request, &CancelToken::new()).await.unwrap();
    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(run.artifact().label(), "1.3.1");
    let lineage = h.stores.releases.releases("prod").await.unwrap();
    assert_eq!(lineage[0].version, "1.3.1");
}

#[tokio::test]
async fn concurrent_prod_deploys_get_distinct_versions() {
    let h = build(
        config(),
        FakeProvisioningEngine::new().with_apply_delay(Duration::from_millis(60)),
        FakeContentStore::new(),
        StageChecks::new(),
    );
    seed_release(&h, "prod", "1.3.0", RunOutcome::Deployed).await;
    let owner_push = |sha: &str| {
        let mut request = main_push(sha).with_environment("prod");
        request.actor = "rita".to_string();
        request
    };

    let cancel = CancelToken::new();
    let (a, b) = tokio::join!(
        h.conductor.submit(owner_push("sha-a"), &cancel),
        h.conductor.submit(owner_push("sha-b"), &cancel),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(b.outcome(), Some(RunOutcome::Deployed));
    assert_ne!(a.artifact().label(), b.artifact().label());

    let mut labels: Vec<String> = h
        .provisioner
        .apply_calls()
        .into_iter()
        .map(|c| c.artifact)
        .collect();
    labels.sort();
    assert_eq!(labels, vec!["1.3.1".to_string(), "1.3.2".to_string()]);

    // Newest first, and every commit shipped under its own version.
    let lineage = h.stores.releases.releases("prod").await.unwrap();
    let versions: Vec<&str> = lineage.iter().map(|r| r.version.as_str()).collect();
    assert_eq!(versions, vec!["1.3.2", "1.3.1", "1.3.0"]);
    let mut revisions: Vec<&str> = lineage[..2]
        .iter()
        .map(|r| r.source_revision.as_str())
        .collect();
    revisions.sort();
    assert_eq!(revisions, vec!["sha-a", "sha-b"]);
}

#[tokio::test]
async fn hotfix_without_reason_is_rejected() {
    let h = harness();
    let request = DeploymentRequest::new(
        TriggerDescriptor::of(TriggerType::ManualDispatch),
        "refs/heads/main",
        "rita",
    )
    .with_environment("prod")
    .with_version_request(VersionRequest::Hotfix);
    let run = h.conductor.submit(request, &CancelToken::new()).await.unwrap();
    assert_eq!(run.operation(), Operation::Hotfix);
    assert_eq!(run.outcome(), Some(RunOutcome::Rejected));
}

#[tokio::test]
async fn unknown_environment_creates_no_run() {
    let h = harness();
    let err = h
        .conductor
        .submit(main_push("sha-a").with_environment("nowhere"), &CancelToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_environment");
    assert!(h.stores.runs.list_runs(None).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Rollback strategies
// ---------------------------------------------------------------------------

async fn seeded_prod() -> Harness {
    let h = harness();
    seed_release(&h, "prod", "1.2.0", RunOutcome::Deployed).await;
    seed_release(&h, "prod", "1.3.0", RunOutcome::Failed).await;
    h.provisioner.mark_applied("prod", "1.3.0");
    h.content.mark_synced("prod", "1.3.0");
    h
}

#[tokio::test]
async fn infrastructure_only_rollback_leaves_content_alone() {
    let h = seeded_prod().await;
    let request = RollbackRequest::new("prod", RollbackStrategy::InfrastructureOnly, "rita")
        .with_reason("revert the load balancer change");
    let report = h.conductor.rollback(request, &CancelToken::new()).await.unwrap();
    let run = report.run.unwrap();

    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(
        run.stage_status(StageName::ContentDeploy),
        Some(StageStatus::Skipped(SkipReason::Excluded))
    );
    assert!(h.content.calls().is_empty());
    assert_eq!(h.content.live("prod").as_deref(), Some("1.3.0"));
    assert_eq!(h.provisioner.live("prod").as_deref(), Some("1.2.0"));
}

#[tokio::test]
async fn content_only_rollback_leaves_infrastructure_alone() {
    let h = seeded_prod().await;
    let request = RollbackRequest::new("prod", RollbackStrategy::ContentOnly, "rita")
        .with_revision("v1.2.0")
        .with_reason("bad stylesheet in 1.3.0");
    let report = h.conductor.rollback(request, &CancelToken::new()).await.unwrap();
    let run = report.run.unwrap();

    assert_eq!(run.outcome(), Some(RunOutcome::Deployed));
    assert_eq!(
        run.stage_status(StageName::InfraApply),
        Some(StageStatus::Skipped(SkipReason::Excluded))
    );
    assert!(h.provisioner.apply_calls().is_empty());
    assert_eq!(h.content.live("prod").as_deref(), Some("1.2.0"));
    assert!(run.lock_window().is_none());
}

#[tokio::test]
async fn rollback_by_non_owner_is_rejected_and_recorded() {
    let h = seeded_prod().await;
    let request = RollbackRequest::new("prod", RollbackStrategy::LastKnownGood, "mike")
        .with_reason("1.3.0 breaks checkout");
    let report = h.conductor.rollback(request, &CancelToken::new()).await.unwrap();

    assert_eq!(report.outcome(), RunOutcome::Rejected);
    assert_eq!(report.record.code, "authorization_denied");
    assert!(report.run.unwrap().stages().is_empty());
    assert!(h.provisioner.apply_calls().is_empty());
    assert_eq!(h.stores.rollbacks.list(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rollback_is_authorized_before_the_target_is_looked_up() {
    let h = harness();
    let request = RollbackRequest::new("prod", RollbackStrategy::SpecificRevision, "mike")
        .with_revision("v9.9.9")
        .with_reason("return to the old checkout");
    let report = h.conductor.rollback(request, &CancelToken::new()).await.unwrap();

    assert_eq!(report.outcome(), RunOutcome::Rejected);
    assert_eq!(report.record.code, "authorization_denied");
    assert!(report.record.target_version.is_none());
    assert!(report.record.rollback_tag.is_none());
    assert!(report.run.unwrap().stages().is_empty());

    let audit = h.stores.audit.list(Some("prod")).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert!(!audit[0].allowed);
}

#[tokio::test]
async fn rollback_without_target_is_recorded_as_failed() {
    let h = harness();
    let request = RollbackRequest::new("prod", RollbackStrategy::LastKnownGood, "rita")
        .with_reason("nothing to go back to");
    let report = h.conductor.rollback(request, &CancelToken::new()).await.unwrap();

    assert!(report.run.is_none());
    assert_eq!(report.outcome(), RunOutcome::Failed);
    assert_eq!(report.record.code, "rollback_target_not_found");
    assert_eq!(h.stores.rollbacks.list(Some("prod")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn pushed_rollback_tag_enters_the_rollback_engine() {
    let h = seeded_prod().await;
    let mut event = push("refs/tags/v1.2.0-rollback.1700000000000", "rita", "ignored");
    event.reason = Some("revert the broken checkout".to_string());

    let completion = h
        .conductor
        .handle_event(&event, &CancelToken::new())
        .await
        .unwrap();
    let Completion::Rollback(report) = completion else {
        panic!("expected a rollback");
    };
    assert_eq!(report.outcome(), RunOutcome::Deployed);
    assert_eq!(report.record.strategy, RollbackStrategy::SpecificRevision);
    assert_eq!(report.record.target_version.as_deref(), Some("1.2.0"));
    assert_eq!(
        report.record.rollback_tag.as_deref(),
        Some("1.2.0-rollback.1700000000000")
    );
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_persists_nothing() {
    let h = harness();
    let request = DeploymentRequest::new(
        TriggerDescriptor::of(TriggerType::ManualDispatch),
        "refs/heads/main",
        "rita",
    )
    .with_environment("prod")
    .with_version_request(VersionRequest::Minor);

    let report = h.conductor.dry_run(&request).await.unwrap();
    assert!(report.would_proceed());
    assert_eq!(report.environment, "prod");
    assert_eq!(report.planned_version.unwrap().to_string(), "0.1.0");
    assert_eq!(report.stages.len(), StageName::ALL.len());
    assert!(report.provisioning_plan.is_some());

    assert!(h.stores.runs.list_runs(None).await.unwrap().is_empty());
    assert!(h.stores.audit.list(None).await.unwrap().is_empty());
    assert!(h.stores.releases.releases("prod").await.unwrap().is_empty());
    assert!(h.stores.status.all().await.unwrap().is_empty());
    assert!(h.provisioner.apply_calls().is_empty());
    assert!(h.notifier.summaries().is_empty());
}

#[tokio::test]
async fn rollback_dry_run_resolves_the_target_without_side_effects() {
    let h = seeded_prod().await;
    let request = RollbackRequest::new("prod", RollbackStrategy::LastKnownGood, "rita")
        .with_reason("1.3.0 breaks checkout");

    let report = h.conductor.dry_run_rollback(&request).await.unwrap();
    assert!(report.would_proceed());
    assert_eq!(report.operation, Operation::Rollback);
    assert_eq!(report.rollback_target.unwrap().to_string(), "1.2.0");
    assert!(report
        .planned_version
        .unwrap()
        .to_string()
        .starts_with("1.2.0-rollback."));
    assert_eq!(report.stages.len(), StageName::ALL.len());
    assert!(report.provisioning_plan.is_some());

    assert!(h.stores.rollbacks.list(None).await.unwrap().is_empty());
    assert!(h.stores.audit.list(None).await.unwrap().is_empty());
    assert_eq!(h.stores.releases.releases("prod").await.unwrap().len(), 2);
    assert!(h.stores.runs.list_runs(None).await.unwrap().is_empty());
    assert!(h.provisioner.apply_calls().is_empty());
    assert_eq!(h.provisioner.live("prod").as_deref(), Some("1.3.0"));
}

#[tokio::test]
async fn rollback_dry_run_reports_denial_and_missing_target() {
    let h = harness();
    let denied = RollbackRequest::new("prod", RollbackStrategy::LastKnownGood, "mike")
        .with_reason("1.3.0 breaks checkout");
    let report = h.conductor.dry_run_rollback(&denied).await.unwrap();
    assert!(!report.would_proceed());
    assert!(report.rollback_target.is_none());

    let missing = RollbackRequest::new("prod", RollbackStrategy::LastKnownGood, "rita")
        .with_reason("1.3.0 breaks checkout");
    let report = h.conductor.dry_run_rollback(&missing).await.unwrap();
    assert!(report.decision.allowed);
    assert!(!report.would_proceed());
    assert!(report.version_error.is_some());
    assert!(h.stores.rollbacks.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn dry_run_reports_denial_without_auditing() {
    let h = harness();
    let request = DeploymentRequest::new(
        TriggerDescriptor::of(TriggerType::ManualDispatch),
        "refs/heads/main",
        "mike",
    )
    .with_environment("prod")
    .with_version_request(VersionRequest::Patch);

    let report = h.conductor.dry_run(&request).await.unwrap();
    assert!(!report.would_proceed());
    assert!(h.stores.audit.list(None).await.unwrap().is_empty());
}
