//! The deployment stage graph.
//!
//! ```text
//! build-validate → test-validate → [infra-apply → post-infra-validate]
//!                → content-deploy → post-deploy-validate
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tierline_core::config::TimeoutConfig;
use tierline_core::Environment;

/// Builtin pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    BuildValidate,
    TestValidate,
    InfraApply,
    PostInfraValidate,
    ContentDeploy,
    PostDeployValidate,
}

impl StageName {
    pub const ALL: [StageName; 6] = [
        StageName::BuildValidate,
        StageName::TestValidate,
        StageName::InfraApply,
        StageName::PostInfraValidate,
        StageName::ContentDeploy,
        StageName::PostDeployValidate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::BuildValidate => "build-validate",
            StageName::TestValidate => "test-validate",
            StageName::InfraApply => "infra-apply",
            StageName::PostInfraValidate => "post-infra-validate",
            StageName::ContentDeploy => "content-deploy",
            StageName::PostDeployValidate => "post-deploy-validate",
        }
    }

    pub fn depends_on(&self) -> &'static [StageName] {
        match self {
            StageName::BuildValidate => &[],
            StageName::TestValidate => &[StageName::BuildValidate],
            StageName::InfraApply => &[StageName::TestValidate],
            StageName::PostInfraValidate => &[StageName::InfraApply],
            StageName::ContentDeploy => &[StageName::TestValidate, StageName::PostInfraValidate],
            StageName::PostDeployValidate => &[StageName::ContentDeploy],
        }
    }

    /// Stages whose success means something was actually deployed.
    pub fn is_mutating(&self) -> bool {
        matches!(self, StageName::InfraApply | StageName::ContentDeploy)
    }

    /// Stages that may be abandoned mid-flight on cancellation.
    pub fn is_cancellable_mid_stage(&self) -> bool {
        matches!(self, StageName::BuildValidate | StageName::TestValidate)
    }

    /// Stages that run inside the per-environment infra lock window.
    pub fn holds_infra_lock(&self) -> bool {
        matches!(self, StageName::InfraApply | StageName::PostInfraValidate)
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stages a run includes. Excluded stages are skipped with reason
/// `excluded` and count as satisfied dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    included: BTreeSet<StageName>,
}

impl ExecutionPlan {
    pub fn full() -> Self {
        Self {
            included: StageName::ALL.into_iter().collect(),
        }
    }

    /// `infra-apply → post-infra-validate` only.
    pub fn infrastructure_only() -> Self {
        Self {
            included: [StageName::InfraApply, StageName::PostInfraValidate]
                .into_iter()
                .collect(),
        }
    }

    /// `content-deploy → post-deploy-validate` only.
    pub fn content_only() -> Self {
        Self {
            included: [StageName::ContentDeploy, StageName::PostDeployValidate]
                .into_iter()
                .collect(),
        }
    }

    /// Drop the infra stages for environments that provision nothing.
    pub fn for_environment(mut self, environment: &Environment) -> Self {
        if !environment.provisions_infrastructure {
            self.included.remove(&StageName::InfraApply);
            self.included.remove(&StageName::PostInfraValidate);
        }
        self
    }

    pub fn includes(&self, stage: StageName) -> bool {
        self.included.contains(&stage)
    }

    /// Included stages in graph order.
    pub fn stages(&self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|s| self.includes(*s))
            .collect()
    }
}

/// Effective time bounds for one run in one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBounds {
    pub validation: Duration,
    pub infra_apply: Duration,
    pub post_infra_validate: Duration,
    pub content_deploy: Duration,
    pub run: Duration,
    pub lock_queue: Duration,
    pub retry_backoff: Duration,
    pub convergence_initial_backoff: Duration,
    pub convergence_max_backoff: Duration,
}

impl StageBounds {
    /// Global timeouts with the environment's resource limits applied.
    pub fn resolve(timeouts: &TimeoutConfig, environment: &Environment) -> Self {
        let limits = &environment.resource_limits;
        let secs = Duration::from_secs;
        Self {
            validation: secs(timeouts.validation_secs),
            infra_apply: secs(
                limits
                    .infra_apply_timeout_secs
                    .unwrap_or(timeouts.infra_apply_secs),
            ),
            post_infra_validate: secs(timeouts.post_infra_validate_secs),
            content_deploy: secs(timeouts.content_deploy_secs),
            run: secs(limits.run_timeout_secs.unwrap_or(timeouts.run_secs)),
            lock_queue: secs(
                limits
                    .lock_queue_timeout_secs
                    .unwrap_or(timeouts.lock_queue_secs),
            ),
            retry_backoff: Duration::from_millis(timeouts.retry_backoff_ms),
            convergence_initial_backoff: Duration::from_millis(
                timeouts.convergence_initial_backoff_ms,
            ),
            convergence_max_backoff: Duration::from_millis(timeouts.convergence_max_backoff_ms),
        }
    }

    pub fn timeout_for(&self, stage: StageName) -> Duration {
        match stage {
            StageName::BuildValidate | StageName::TestValidate | StageName::PostDeployValidate => {
                self.validation
            }
            StageName::InfraApply => self.infra_apply,
            StageName::PostInfraValidate => self.post_infra_validate,
            StageName::ContentDeploy => self.content_deploy,
        }
    }
}
