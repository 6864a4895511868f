//! Environment resolution.
//!
//! A pure function of (trigger type, explicit environment, configured
//! environments, fallback). First defined value wins:
//!
//! 1. the caller's explicit environment
//! 2. the trigger's default tier (feature push → dev, pull request and main
//!    push → staging, release tag → prod)
//! 3. the configured fallback
//!
//! Emergencies have no default and never use the fallback; the caller must
//! name the environment.

use crate::domain::{DeployError, Environment, EnvironmentSet, Result, Tier, TriggerType};

/// Default tier for a trigger, if it has one.
pub fn default_tier(trigger: TriggerType) -> Option<Tier> {
    match trigger {
        TriggerType::FeaturePush => Some(Tier::Dev),
        TriggerType::PullRequest | TriggerType::MainPush => Some(Tier::Staging),
        TriggerType::ReleaseTag => Some(Tier::Prod),
        TriggerType::Emergency | TriggerType::ManualDispatch => None,
    }
}

/// Resolve and validate the target environment.
pub fn resolve_environment<'a>(
    trigger: TriggerType,
    explicit: Option<&str>,
    environments: &'a EnvironmentSet,
    fallback: Option<&str>,
) -> Result<&'a Environment> {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        return lookup(environments, name);
    }

    if trigger == TriggerType::Emergency {
        return Err(DeployError::InvalidEnvironment(
            "emergency requests must name an environment".to_string(),
        ));
    }

    if let Some(env) = default_tier(trigger).and_then(|tier| environments.first_of_tier(tier)) {
        return Ok(env);
    }

    match fallback {
        Some(name) => lookup(environments, name),
        None => Err(DeployError::InvalidEnvironment(format!(
            "no environment resolved for trigger {}",
            trigger
        ))),
    }
}

fn lookup<'a>(environments: &'a EnvironmentSet, name: &str) -> Result<&'a Environment> {
    environments.get(name).ok_or_else(|| {
        DeployError::InvalidEnvironment(format!(
            "'{}' is not configured (known: {})",
            name,
            environments.names().join(", ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs() -> EnvironmentSet {
        EnvironmentSet::standard()
    }

    #[test]
    fn test_trigger_defaults() {
        let set = envs();
        let cases = [
            (TriggerType::FeaturePush, "dev"),
            (TriggerType::PullRequest, "staging"),
            (TriggerType::MainPush, "staging"),
            (TriggerType::ReleaseTag, "prod"),
        ];
        for (trigger, expected) in cases {
            assert_eq!(
                resolve_environment(trigger, None, &set, None).unwrap().name,
                expected
            );
        }
    }

    #[test]
    fn test_explicit_wins_over_default() {
        let set = envs();
        let env = resolve_environment(TriggerType::MainPush, Some("dev"), &set, None).unwrap();
        assert_eq!(env.name, "dev");
    }

    #[test]
    fn test_manual_dispatch_uses_fallback() {
        let set = envs();
        let env =
            resolve_environment(TriggerType::ManualDispatch, None, &set, Some("staging")).unwrap();
        assert_eq!(env.name, "staging");

        let err = resolve_environment(TriggerType::ManualDispatch, None, &set, None).unwrap_err();
        assert_eq!(err.code(), "invalid_environment");
    }

    #[test]
    fn test_emergency_requires_explicit_environment() {
        let set = envs();
        let err =
            resolve_environment(TriggerType::Emergency, None, &set, Some("prod")).unwrap_err();
        assert_eq!(err.code(), "invalid_environment");
        assert_eq!(
            resolve_environment(TriggerType::Emergency, Some("prod"), &set, None)
                .unwrap()
                .name,
            "prod"
        );
    }

    #[test]
    fn test_unknown_environment_is_rejected() {
        let set = envs();
        let err = resolve_environment(TriggerType::MainPush, Some("qa"), &set, None).unwrap_err();
        assert!(err.to_string().contains("qa"));
    }

    #[test]
    fn test_missing_tier_falls_back() {
        let set = EnvironmentSet::new(vec![Environment::new("sandbox", Tier::Dev)]);
        let env =
            resolve_environment(TriggerType::MainPush, None, &set, Some("sandbox")).unwrap();
        assert_eq!(env.name, "sandbox");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let set = envs();
        for trigger in [
            TriggerType::FeaturePush,
            TriggerType::PullRequest,
            TriggerType::MainPush,
            TriggerType::ReleaseTag,
            TriggerType::ManualDispatch,
        ] {
            for explicit in [None, Some("dev"), Some("prod")] {
                let first = resolve_environment(trigger, explicit, &set, Some("dev"))
                    .map(|e| e.name.clone())
                    .ok();
                let second = resolve_environment(trigger, explicit, &set, Some("dev"))
                    .map(|e| e.name.clone())
                    .ok();
                assert_eq!(first, second);
            }
        }
    }
}
