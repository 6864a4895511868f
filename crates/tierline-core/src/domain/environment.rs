//! Deployment environments and their risk tiers.

use serde::{Deserialize, Serialize};

/// Risk classification of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Dev,
    Staging,
    Prod,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Dev => "dev",
            Tier::Staging => "staging",
            Tier::Prod => "prod",
        }
    }

    /// Approval policy a tier carries when no override is configured.
    pub fn default_policy(&self) -> ApprovalPolicy {
        match self {
            Tier::Dev => ApprovalPolicy::Open,
            Tier::Staging => ApprovalPolicy::Authenticated,
            Tier::Prod => ApprovalPolicy::Owners,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may mutate an environment. Ordered from least to most strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// No check at all.
    Open,
    /// Any actor the authorization source recognises.
    Authenticated,
    /// Members of the owners set only.
    Owners,
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::Open => "open",
            ApprovalPolicy::Authenticated => "authenticated",
            ApprovalPolicy::Owners => "owners",
        }
    }
}

/// Per-environment overrides of the global stage bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub infra_apply_timeout_secs: Option<u64>,
    #[serde(default)]
    pub lock_queue_timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// A configured deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub tier: Tier,
    /// Optional override; it can only tighten the tier default.
    #[serde(default)]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Environments without their own infrastructure skip the infra stages.
    #[serde(default = "default_true")]
    pub provisions_infrastructure: bool,
}

impl Environment {
    pub fn new(name: impl Into<String>, tier: Tier) -> Self {
        Self {
            name: name.into(),
            tier,
            approval_policy: None,
            resource_limits: ResourceLimits::default(),
            provisions_infrastructure: true,
        }
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval_policy = Some(policy);
        self
    }

    pub fn without_infrastructure(mut self) -> Self {
        self.provisions_infrastructure = false;
        self
    }

    /// The stricter of the tier default and the configured override.
    pub fn effective_policy(&self) -> ApprovalPolicy {
        let default = self.tier.default_policy();
        match self.approval_policy {
            Some(policy) => policy.max(default),
            None => default,
        }
    }
}

/// The configured environment set, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentSet {
    environments: Vec<Environment>,
}

impl EnvironmentSet {
    pub fn new(environments: Vec<Environment>) -> Self {
        Self { environments }
    }

    /// The conventional dev/staging/prod trio.
    pub fn standard() -> Self {
        Self::new(vec![
            Environment::new("dev", Tier::Dev),
            Environment::new("staging", Tier::Staging),
            Environment::new("prod", Tier::Prod),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// First environment declared with the given tier.
    pub fn first_of_tier(&self, tier: Tier) -> Option<&Environment> {
        self.environments.iter().find(|e| e.tier == tier)
    }

    pub fn names(&self) -> Vec<&str> {
        self.environments.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.environments.iter()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_defaults() {
        assert_eq!(Tier::Dev.default_policy(), ApprovalPolicy::Open);
        assert_eq!(Tier::Staging.default_policy(), ApprovalPolicy::Authenticated);
        assert_eq!(Tier::Prod.default_policy(), ApprovalPolicy::Owners);
    }

    #[test]
    fn test_override_only_tightens() {
        let loosened = Environment::new("prod", Tier::Prod).with_policy(ApprovalPolicy::Open);
        assert_eq!(loosened.effective_policy(), ApprovalPolicy::Owners);

        let tightened = Environment::new("dev", Tier::Dev).with_policy(ApprovalPolicy::Owners);
        assert_eq!(tightened.effective_policy(), ApprovalPolicy::Owners);
    }

    #[test]
    fn test_environment_deserialize_defaults() {
        let env: Environment = serde_json::from_str(r#"{"name":"qa","tier":"staging"}"#).unwrap();
        assert!(env.provisions_infrastructure);
        assert_eq!(env.approval_policy, None);
        assert_eq!(env.resource_limits, ResourceLimits::default());
    }

    #[test]
    fn test_first_of_tier_follows_declaration_order() {
        let set = EnvironmentSet::new(vec![
            Environment::new("staging-eu", Tier::Staging),
            Environment::new("staging-us", Tier::Staging),
        ]);
        assert_eq!(set.first_of_tier(Tier::Staging).unwrap().name, "staging-eu");
        assert!(set.first_of_tier(Tier::Prod).is_none());
    }
}
