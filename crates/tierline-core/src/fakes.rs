//! In-memory fakes of every external collaborator.
//!
//! They record every call so tests can assert call contracts, and expose
//! knobs for delays, failures and transient errors.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::authz::{AuthorizationAnswer, AuthorizationSource, Role};
use crate::domain::Environment;
use crate::external::{
    ApplyReport, Artifact, CheckContext, CheckReport, ContentStore, Convergence, ExternalError,
    ExternalResult, NotificationSink, PlanReport, ProvisioningEngine, RunSummary, SyncReport,
    ValidationCheck,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: &'static str,
    pub environment: String,
    pub artifact: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FakeProvisioningEngine
// ---------------------------------------------------------------------------

/// Tracks the live artifact per environment: an apply reports `changed`
/// only when it moves the environment to a different artifact.
#[derive(Debug, Default)]
pub struct FakeProvisioningEngine {
    live: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<Call>>,
    apply_delay: Duration,
    failing: bool,
    transient_failures: AtomicU32,
    pending_polls: AtomicU32,
    polls: AtomicU32,
}

impl FakeProvisioningEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// Every apply reports a permanent failure.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// The first `n` applies return a transient error.
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The first `n` convergence polls report pending.
    pub fn with_pending_polls(self, n: u32) -> Self {
        self.pending_polls.store(n, Ordering::SeqCst);
        self
    }

    /// Pretend `artifact` is already live in `environment`.
    pub fn mark_applied(&self, environment: &str, artifact: &str) {
        lock(&self.live).insert(environment.to_string(), artifact.to_string());
    }

    pub fn live(&self, environment: &str) -> Option<String> {
        lock(&self.live).get(environment).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn apply_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == "apply")
            .collect()
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    fn record(
        &self,
        operation: &'static str,
        env: &Environment,
        artifact: &Artifact,
        started_at: DateTime<Utc>,
    ) {
        lock(&self.calls).push(Call {
            operation,
            environment: env.name.clone(),
            artifact: artifact.label(),
            started_at,
            finished_at: Utc::now(),
        });
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ProvisioningEngine for FakeProvisioningEngine {
    async fn apply(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> ExternalResult<ApplyReport> {
        let started_at = Utc::now();
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        let result = if take_one(&self.transient_failures) {
            Err(ExternalError::Transient("provider throttled".to_string()))
        } else if self.failing {
            Ok(ApplyReport {
                success: false,
                changed: false,
                error: Some("apply rejected by provider".to_string()),
            })
        } else {
            let label = artifact.label();
            let previous = lock(&self.live).insert(environment.name.clone(), label.clone());
            Ok(ApplyReport {
                success: true,
                changed: previous.as_deref() != Some(label.as_str()),
                error: None,
            })
        };
        self.record("apply", environment, artifact, started_at);
        result
    }

    async fn plan(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> ExternalResult<PlanReport> {
        let started_at = Utc::now();
        let label = artifact.label();
        let pending = lock(&self.live).get(&environment.name) != Some(&label);
        self.record("plan", environment, artifact, started_at);
        Ok(PlanReport {
            success: true,
            diff_summary: if pending {
                format!("apply {} to {}", label, environment.name)
            } else {
                "no changes".to_string()
            },
        })
    }

    async fn converged(
        &self,
        _environment: &Environment,
        _artifact: &Artifact,
    ) -> ExternalResult<Convergence> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.pending_polls) {
            Ok(Convergence::Pending)
        } else {
            Ok(Convergence::Converged)
        }
    }
}

// ---------------------------------------------------------------------------
// FakeContentStore
// ---------------------------------------------------------------------------

/// Same live-artifact semantics as [`FakeProvisioningEngine`].
#[derive(Debug, Default)]
pub struct FakeContentStore {
    live: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<Call>>,
    failing: bool,
}

impl FakeContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn mark_synced(&self, environment: &str, artifact: &str) {
        lock(&self.live).insert(environment.to_string(), artifact.to_string());
    }

    pub fn live(&self, environment: &str) -> Option<String> {
        lock(&self.live).get(environment).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ContentStore for FakeContentStore {
    async fn sync(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> ExternalResult<SyncReport> {
        let started_at = Utc::now();
        let report = if self.failing {
            SyncReport {
                success: false,
                changed: false,
                error: Some("bucket unavailable".to_string()),
            }
        } else {
            let label = artifact.label();
            let previous = lock(&self.live).insert(environment.name.clone(), label.clone());
            SyncReport {
                success: true,
                changed: previous.as_deref() != Some(label.as_str()),
                error: None,
            }
        };
        lock(&self.calls).push(Call {
            operation: "sync",
            environment: environment.name.clone(),
            artifact: artifact.label(),
            started_at,
            finished_at: Utc::now(),
        });
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// FakeCheck
// ---------------------------------------------------------------------------

/// Tracks how many checks sharing it run at once.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A validation check with a scripted verdict.
#[derive(Debug)]
pub struct FakeCheck {
    name: String,
    passes: bool,
    delay: Duration,
    runs: AtomicU32,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl FakeCheck {
    pub fn passing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passes: true,
            delay: Duration::ZERO,
            runs: AtomicU32::new(0),
            gauge: None,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            passes: false,
            ..Self::passing(name)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValidationCheck for FakeCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &CheckContext) -> ExternalResult<CheckReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        Ok(CheckReport {
            name: self.name.clone(),
            passed: self.passes,
            detail: if self.passes { "ok" } else { "check failed" }.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// StaticAuthorizationSource
// ---------------------------------------------------------------------------

/// Fixed actor → role table.
#[derive(Debug, Default)]
pub struct StaticAuthorizationSource {
    roles: HashMap<String, Role>,
    denied: HashSet<(String, String)>,
    unavailable: bool,
}

impl StaticAuthorizationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every query errors, as if the directory were down.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn with_actor(mut self, actor: &str, role: Role) -> Self {
        self.roles.insert(actor.to_string(), role);
        self
    }

    pub fn deny(mut self, actor: &str, environment: &str) -> Self {
        self.denied
            .insert((actor.to_string(), environment.to_string()));
        self
    }
}

#[async_trait]
impl AuthorizationSource for StaticAuthorizationSource {
    async fn query(
        &self,
        actor: &str,
        environment: &str,
    ) -> ExternalResult<AuthorizationAnswer> {
        if self.unavailable {
            return Err(ExternalError::Transient("directory unreachable".to_string()));
        }
        Ok(match self.roles.get(actor) {
            None => AuthorizationAnswer {
                allowed: false,
                role: Role::Anonymous,
            },
            Some(role) => AuthorizationAnswer {
                allowed: !self
                    .denied
                    .contains(&(actor.to_string(), environment.to_string())),
                role: *role,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

/// Keeps every summary it is handed.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    summaries: Mutex<Vec<RunSummary>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records, then reports failure.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        lock(&self.summaries).clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn publish(&self, summary: &RunSummary) -> ExternalResult<()> {
        lock(&self.summaries).push(summary.clone());
        if self.failing {
            Err(ExternalError::Permanent("sink offline".to_string()))
        } else {
            Ok(())
        }
    }
}
