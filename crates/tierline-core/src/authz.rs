//! Authorization gate.
//!
//! The policy in force is the environment's effective [`ApprovalPolicy`],
//! except that rollbacks always run under [`ApprovalPolicy::Owners`].
//!
//! | policy        | requirement                                             |
//! |---------------|---------------------------------------------------------|
//! | open          | none                                                    |
//! | authenticated | the source recognises the actor and allows it           |
//! | owners        | allowed, and an owner (configured set or registry role) |
//!
//! Under `owners`, hotfix, emergency and rollback operations also need a
//! reason of at least `min_reason_len` characters. Every decision is
//! appended to the audit trail before it is returned.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tierline_state::{AuthorizationAudit, AuthorizationDecisionRecord, RunId};

use crate::domain::{ApprovalPolicy, DeployError, Environment, Operation, Result};
use crate::external::ExternalError;

// ---------------------------------------------------------------------------
// Authorization source
// ---------------------------------------------------------------------------

/// Role an authorization source reports for an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Member,
    /// The source does not know the actor.
    Anonymous,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Member => "member",
            Role::Anonymous => "anonymous",
        }
    }
}

/// Answer to `query(actor, environment)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationAnswer {
    pub allowed: bool,
    pub role: Role,
}

/// External directory of actors and roles.
#[async_trait]
pub trait AuthorizationSource: Send + Sync {
    async fn query(
        &self,
        actor: &str,
        environment: &str,
    ) -> std::result::Result<AuthorizationAnswer, ExternalError>;
}

/// One actor entry in a flat registry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorEntry {
    pub role: Role,
    /// Environments this actor may never touch.
    #[serde(default)]
    pub denied_environments: Vec<String>,
}

/// Flat JSON registry: `{"actors": {"alice": {"role": "owner"}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRegistry {
    #[serde(default)]
    pub actors: BTreeMap<String, ActorEntry>,
}

impl ActorRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// [`AuthorizationSource`] backed by an [`ActorRegistry`].
#[derive(Debug, Clone, Default)]
pub struct RegistryAuthorizationSource {
    registry: ActorRegistry,
}

impl RegistryAuthorizationSource {
    pub fn new(registry: ActorRegistry) -> Self {
        Self { registry }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(ActorRegistry::load(path)?))
    }
}

#[async_trait]
impl AuthorizationSource for RegistryAuthorizationSource {
    async fn query(
        &self,
        actor: &str,
        environment: &str,
    ) -> std::result::Result<AuthorizationAnswer, ExternalError> {
        Ok(match self.registry.actors.get(actor) {
            None => AuthorizationAnswer {
                allowed: false,
                role: Role::Anonymous,
            },
            Some(entry) => AuthorizationAnswer {
                allowed: !entry.denied_environments.iter().any(|e| e == environment),
                role: entry.role,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of one gate evaluation. Cached for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub actor: String,
    pub environment: String,
    pub operation: Operation,
    pub policy: ApprovalPolicy,
    pub role: Option<Role>,
    pub allowed: bool,
    pub policy_reason: String,
    pub decided_at: DateTime<Utc>,
}

impl AuthorizationDecision {
    pub fn to_record(&self, run_id: &RunId) -> AuthorizationDecisionRecord {
        AuthorizationDecisionRecord {
            actor: self.actor.clone(),
            environment: self.environment.clone(),
            operation: self.operation.as_str().to_string(),
            role: self.role.map(|r| r.as_str().to_string()),
            allowed: self.allowed,
            policy_reason: self.policy_reason.clone(),
            run_id: run_id.clone(),
            decided_at: self.decided_at,
        }
    }

    /// `Err(AuthorizationDenied)` when the decision is a denial.
    pub fn require_allowed(&self) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(DeployError::AuthorizationDenied {
                actor: self.actor.clone(),
                environment: self.environment.clone(),
                reason: self.policy_reason.clone(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub const DEFAULT_MIN_REASON_LEN: usize = 10;

/// Blocking, binary authorization check with an audit trail.
pub struct AuthorizationGate {
    source: Arc<dyn AuthorizationSource>,
    audit: Arc<dyn AuthorizationAudit>,
    owners: BTreeSet<String>,
    min_reason_len: usize,
}

impl AuthorizationGate {
    pub fn new(source: Arc<dyn AuthorizationSource>, audit: Arc<dyn AuthorizationAudit>) -> Self {
        Self {
            source,
            audit,
            owners: BTreeSet::new(),
            min_reason_len: DEFAULT_MIN_REASON_LEN,
        }
    }

    pub fn with_owners<I, S>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owners = owners.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_reason_len(mut self, len: usize) -> Self {
        self.min_reason_len = len;
        self
    }

    /// Policy in force for an operation on an environment.
    pub fn policy_for(environment: &Environment, operation: Operation) -> ApprovalPolicy {
        if operation == Operation::Rollback {
            ApprovalPolicy::Owners
        } else {
            environment.effective_policy()
        }
    }

    /// Evaluate and audit. Errors only when the audit write fails.
    pub async fn authorize(
        &self,
        run_id: &RunId,
        actor: &str,
        environment: &Environment,
        operation: Operation,
        reason: Option<&str>,
    ) -> Result<AuthorizationDecision> {
        let decision = self.evaluate(actor, environment, operation, reason).await;
        self.audit.append(&decision.to_record(run_id)).await?;
        crate::obs::emit_authorization_decided(
            run_id.0.as_str(),
            actor,
            &environment.name,
            operation.as_str(),
            decision.allowed,
            &decision.policy_reason,
        );
        Ok(decision)
    }

    /// Evaluate without recording. Used for dry runs.
    pub async fn evaluate(
        &self,
        actor: &str,
        environment: &Environment,
        operation: Operation,
        reason: Option<&str>,
    ) -> AuthorizationDecision {
        let policy = Self::policy_for(environment, operation);
        let (allowed, role, policy_reason) = match policy {
            ApprovalPolicy::Open => (true, None, format!("{} tier requires no check", environment.tier)),
            ApprovalPolicy::Authenticated | ApprovalPolicy::Owners => {
                match self.source.query(actor, &environment.name).await {
                    Ok(answer) => {
                        let (allowed, why) = self.judge(policy, actor, answer, operation, reason);
                        (allowed, Some(answer.role), why)
                    }
                    Err(e) => (false, None, format!("authorization source unavailable: {}", e)),
                }
            }
        };

        AuthorizationDecision {
            actor: actor.to_string(),
            environment: environment.name.clone(),
            operation,
            policy,
            role,
            allowed,
            policy_reason,
            decided_at: Utc::now(),
        }
    }

    fn judge(
        &self,
        policy: ApprovalPolicy,
        actor: &str,
        answer: AuthorizationAnswer,
        operation: Operation,
        reason: Option<&str>,
    ) -> (bool, String) {
        if answer.role == Role::Anonymous {
            return (false, format!("actor '{}' is not known", actor));
        }
        if !answer.allowed {
            return (false, format!("actor '{}' is not allowed here", actor));
        }
        if policy == ApprovalPolicy::Authenticated {
            return (true, "authenticated actor".to_string());
        }

        let is_owner = self.owners.contains(actor) || answer.role == Role::Owner;
        if !is_owner {
            return (false, format!("actor '{}' is not an owner", actor));
        }
        if operation.requires_reason() {
            let length = reason.map(|r| r.trim().chars().count()).unwrap_or(0);
            if length < self.min_reason_len {
                return (
                    false,
                    format!(
                        "{} requires a reason of at least {} characters",
                        operation, self.min_reason_len
                    ),
                );
            }
        }
        (true, "owner".to_string())
    }
}
