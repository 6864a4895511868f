//! Trigger classification.
//!
//! An ordered rule list turns a [`RawEvent`] into a [`TriggerDescriptor`];
//! the first rule that matches wins:
//!
//! 1. emergency flag set by the caller
//! 2. release tag with a hotfix or rollback suffix
//! 3. plain release tag (optionally `-rc.N`)
//! 4. pull request targeting the main branch
//! 5. push to the main branch
//! 6. push to any other branch (also pull requests against other bases)
//! 7. manual invocation with no matching ref

use regex::Regex;

use crate::domain::{
    DeployError, DeploymentRequest, EventKind, RawEvent, ReleaseTag, Result, TriggerDescriptor,
    TriggerType,
};
use crate::version::{Version, VersionRequest};

/// A ref after stripping its `refs/...` namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GitRef {
    Branch(String),
    Tag(String),
}

/// Stateless, side-effect-free event classifier.
#[derive(Debug, Clone)]
pub struct TriggerClassifier {
    main_branch: String,
    tag_prefix: String,
    suffixed_tag: Regex,
    plain_tag: Regex,
}

impl TriggerClassifier {
    pub fn new(main_branch: &str, tag_prefix: &str) -> Result<Self> {
        let prefix = regex::escape(tag_prefix);
        let core = r"\d+\.\d+\.\d+";
        let compile = |pattern: String| {
            Regex::new(&pattern)
                .map_err(|e| DeployError::Config(format!("release tag pattern: {}", e)))
        };
        Ok(Self {
            main_branch: main_branch.to_string(),
            tag_prefix: tag_prefix.to_string(),
            suffixed_tag: compile(format!(r"^(?:{prefix})?{core}-(?:hotfix|rollback)\.\d+$"))?,
            plain_tag: compile(format!(r"^(?:{prefix})?{core}(?:-rc\.\d+)?$"))?,
        })
    }

    /// Classify an event. Fails only on malformed input.
    pub fn classify(&self, event: &RawEvent) -> Result<TriggerDescriptor> {
        let kind = EventKind::parse(&event.kind)?;
        if event.actor.trim().is_empty() {
            return Err(DeployError::MalformedEvent("event has no actor".to_string()));
        }
        let git_ref = self.parse_ref(&event.git_ref);
        if git_ref.is_none() && kind != EventKind::Manual {
            return Err(DeployError::MalformedEvent(format!(
                "{} event without a ref",
                event.kind
            )));
        }

        if event.is_emergency() {
            return Ok(TriggerDescriptor {
                trigger_type: TriggerType::Emergency,
                branch: branch_of(&git_ref),
                tag: None,
            });
        }

        if let Some(GitRef::Tag(tag)) = &git_ref {
            return match self.release_tag(tag)? {
                Some(release) => Ok(TriggerDescriptor {
                    trigger_type: TriggerType::ReleaseTag,
                    branch: None,
                    tag: Some(release),
                }),
                None if kind == EventKind::Manual => {
                    Ok(TriggerDescriptor::of(TriggerType::ManualDispatch))
                }
                None => Err(DeployError::MalformedEvent(format!(
                    "tag '{}' matches no release pattern",
                    tag
                ))),
            };
        }

        let branch = branch_of(&git_ref);
        let trigger_type = match kind {
            EventKind::PullRequest => {
                let base = event
                    .payload
                    .get("base_ref")
                    .and_then(|b| b.as_str())
                    .map(|b| b.strip_prefix("refs/heads/").unwrap_or(b))
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| {
                        DeployError::MalformedEvent(
                            "pull request payload has no base_ref".to_string(),
                        )
                    })?;
                if base == self.main_branch {
                    TriggerType::PullRequest
                } else {
                    TriggerType::FeaturePush
                }
            }
            EventKind::Push if branch.as_deref() == Some(self.main_branch.as_str()) => {
                TriggerType::MainPush
            }
            EventKind::Push => TriggerType::FeaturePush,
            EventKind::Manual => TriggerType::ManualDispatch,
        };

        Ok(TriggerDescriptor {
            trigger_type,
            branch,
            tag: None,
        })
    }

    /// Classify and build the immutable request in one step.
    pub fn request_from(&self, event: &RawEvent) -> Result<DeploymentRequest> {
        let trigger = self.classify(event)?;
        let explicit_version_request = event
            .explicit_version_request
            .as_deref()
            .map(VersionRequest::parse)
            .transpose()?;

        let mut request = DeploymentRequest::new(trigger, &event.git_ref, &event.actor);
        request.explicit_environment = event
            .explicit_environment
            .as_ref()
            .filter(|e| !e.trim().is_empty())
            .cloned();
        request.explicit_version_request = explicit_version_request;
        request.reason = event.reason.clone();
        request.revision = ["after", "sha", "head_sha"]
            .iter()
            .filter_map(|key| event.payload.get(*key).and_then(|v| v.as_str()))
            .find(|sha| !sha.trim().is_empty())
            .map(str::to_string);
        Ok(request)
    }

    /// Recognise a release tag, most specific pattern first.
    fn release_tag(&self, tag: &str) -> Result<Option<ReleaseTag>> {
        if !self.suffixed_tag.is_match(tag) && !self.plain_tag.is_match(tag) {
            return Ok(None);
        }
        let body = tag.strip_prefix(self.tag_prefix.as_str()).unwrap_or(tag);
        let version = Version::parse(body)?;
        Ok(Some(ReleaseTag {
            tag: tag.to_string(),
            kind: version.kind(),
            version,
        }))
    }

    fn parse_ref(&self, raw: &str) -> Option<GitRef> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(branch) = raw.strip_prefix("refs/heads/") {
            return Some(GitRef::Branch(branch.to_string()));
        }
        if let Some(tag) = raw.strip_prefix("refs/tags/") {
            return Some(GitRef::Tag(tag.to_string()));
        }
        if self.suffixed_tag.is_match(raw) || self.plain_tag.is_match(raw) {
            Some(GitRef::Tag(raw.to_string()))
        } else {
            Some(GitRef::Branch(raw.to_string()))
        }
    }
}

fn branch_of(git_ref: &Option<GitRef>) -> Option<String> {
    match git_ref {
        Some(GitRef::Branch(b)) => Some(b.clone()),
        _ => None,
    }
}
