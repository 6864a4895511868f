//! Pipeline configuration.
//!
//! Loaded from a JSON file, then overlaid with `TIERLINE_*` environment
//! variables. A missing file yields the built-in defaults.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::authz::{ActorEntry, ActorRegistry, DEFAULT_MIN_REASON_LEN};
use crate::command::CommandSpec;
use crate::domain::{DeployError, Environment, EnvironmentSet, Result};

pub const DEFAULT_CONFIG_PATH: &str = "tierline.json";
pub const DEFAULT_STATE_URL: &str = "surrealkv://.tierline/state";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Who may do what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Designated owners, in addition to registry actors with role `owner`.
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default = "default_min_reason_len")]
    pub min_reason_len: usize,
    /// External registry file; merged over the inline `actors`.
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    #[serde(default)]
    pub actors: BTreeMap<String, ActorEntry>,
}

fn default_min_reason_len() -> usize {
    DEFAULT_MIN_REASON_LEN
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            owners: Vec::new(),
            min_reason_len: DEFAULT_MIN_REASON_LEN,
            registry_path: None,
            actors: BTreeMap::new(),
        }
    }
}

impl AuthorizationConfig {
    /// Inline actors overlaid with the registry file, when one is configured.
    pub fn registry(&self) -> Result<ActorRegistry> {
        let mut registry = ActorRegistry {
            actors: self.actors.clone(),
        };
        if let Some(path) = &self.registry_path {
            registry.actors.extend(ActorRegistry::load(path)?.actors);
        }
        Ok(registry)
    }
}

/// Stage and run bounds, in seconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub validation_secs: u64,
    pub infra_apply_secs: u64,
    pub post_infra_validate_secs: u64,
    pub content_deploy_secs: u64,
    pub run_secs: u64,
    pub lock_queue_secs: u64,
    pub retry_backoff_ms: u64,
    pub convergence_initial_backoff_ms: u64,
    pub convergence_max_backoff_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            validation_secs: 600,
            infra_apply_secs: 3600,
            post_infra_validate_secs: 900,
            content_deploy_secs: 1800,
            run_secs: 7200,
            lock_queue_secs: 3600,
            retry_backoff_ms: 5_000,
            convergence_initial_backoff_ms: 1_000,
            convergence_max_backoff_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    fn fields(&self) -> [(&'static str, u64); 9] {
        [
            ("validation_secs", self.validation_secs),
            ("infra_apply_secs", self.infra_apply_secs),
            ("post_infra_validate_secs", self.post_infra_validate_secs),
            ("content_deploy_secs", self.content_deploy_secs),
            ("run_secs", self.run_secs),
            ("lock_queue_secs", self.lock_queue_secs),
            ("retry_backoff_ms", self.retry_backoff_ms),
            (
                "convergence_initial_backoff_ms",
                self.convergence_initial_backoff_ms,
            ),
            ("convergence_max_backoff_ms", self.convergence_max_backoff_ms),
        ]
    }

    pub fn validation(&self) -> Duration {
        Duration::from_secs(self.validation_secs)
    }

    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Provisioning engine commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningCommands {
    pub apply: CommandSpec,
    #[serde(default)]
    pub plan: Option<CommandSpec>,
    #[serde(default)]
    pub converge: Option<CommandSpec>,
}

/// Content store command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCommands {
    pub sync: CommandSpec,
}

/// A named validation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,
    #[serde(flatten)]
    pub command: CommandSpec,
}

/// Checks per validation stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub build_validate: Vec<CheckConfig>,
    pub test_validate: Vec<CheckConfig>,
    pub post_infra_validate: Vec<CheckConfig>,
    pub post_deploy_validate: Vec<CheckConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_tag_prefix() -> String {
    "v".to_string()
}

fn default_state_url() -> String {
    DEFAULT_STATE_URL.to_string()
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    #[serde(default = "EnvironmentSet::standard")]
    pub environments: EnvironmentSet,
    #[serde(default)]
    pub fallback_environment: Option<String>,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub provisioning: Option<ProvisioningCommands>,
    #[serde(default)]
    pub content: Option<ContentCommands>,
    #[serde(default)]
    pub checks: ChecksConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default = "default_state_url")]
    pub state_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            main_branch: default_main_branch(),
            tag_prefix: default_tag_prefix(),
            environments: EnvironmentSet::standard(),
            fallback_environment: None,
            authorization: AuthorizationConfig::default(),
            timeouts: TimeoutConfig::default(),
            provisioning: None,
            content: None,
            checks: ChecksConfig::default(),
            notify: NotifyConfig::default(),
            state_url: default_state_url(),
        }
    }
}

impl PipelineConfig {
    /// Read, overlay the process environment, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file. A missing file yields defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                DeployError::Config(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Overlay `TIERLINE_*` variables from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("TIERLINE_STATE_URL") {
            self.state_url = url;
        }
        if let Some(env) = non_empty("TIERLINE_FALLBACK_ENVIRONMENT") {
            self.fallback_environment = Some(env);
        }
        if let Some(branch) = non_empty("TIERLINE_MAIN_BRANCH") {
            self.main_branch = branch;
        }
        if let Some(url) = non_empty("TIERLINE_NOTIFY_URL") {
            self.notify.webhook_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.environments.is_empty() {
            return Err(DeployError::Config("no environments configured".to_string()));
        }
        let mut seen = HashSet::new();
        for env in self.environments.iter() {
            if env.name.trim().is_empty() {
                return Err(DeployError::Config("environment with empty name".to_string()));
            }
            if !seen.insert(env.name.as_str()) {
                return Err(DeployError::Config(format!(
                    "duplicate environment '{}'",
                    env.name
                )));
            }
            if Self::has_zero_limit(env) {
                return Err(DeployError::Config(format!(
                    "environment '{}' has a zero resource limit",
                    env.name
                )));
            }
        }
        if let Some(fallback) = &self.fallback_environment {
            if self.environments.get(fallback).is_none() {
                return Err(DeployError::Config(format!(
                    "fallback environment '{}' is not configured",
                    fallback
                )));
            }
        }
        if let Some((name, _)) = self.timeouts.fields().iter().find(|(_, v)| *v == 0) {
            return Err(DeployError::Config(format!("timeouts.{} must be > 0", name)));
        }
        if self.main_branch.trim().is_empty() {
            return Err(DeployError::Config("main_branch must not be empty".to_string()));
        }
        Ok(())
    }

    fn has_zero_limit(env: &Environment) -> bool {
        let limits = &env.resource_limits;
        [
            limits.run_timeout_secs,
            limits.infra_apply_timeout_secs,
            limits.lock_queue_timeout_secs,
        ]
        .contains(&Some(0))
    }
}
