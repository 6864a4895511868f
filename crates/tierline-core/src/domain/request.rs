//! Inbound events and the immutable deployment request derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tierline_state::ReleaseKind;

use crate::domain::error::{DeployError, Result};
use crate::version::{Version, VersionRequest};

// ---------------------------------------------------------------------------
// Raw inbound event
// ---------------------------------------------------------------------------

/// Source-control event kinds the classifier understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Manual,
}

impl EventKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "push" => Ok(EventKind::Push),
            "pull_request" => Ok(EventKind::PullRequest),
            "manual" => Ok(EventKind::Manual),
            other => Err(DeployError::MalformedEvent(format!(
                "unknown event kind '{}'",
                other
            ))),
        }
    }
}

/// Caller-controlled flags on a manual invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualFlags {
    #[serde(default)]
    pub emergency: bool,
}

/// An inbound trigger event exactly as received.
///
/// `kind` stays a string so that an unknown kind surfaces as a
/// `MalformedEvent` rather than a deserialization error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(alias = "event_kind")]
    pub kind: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub manual_flags: Option<ManualFlags>,
    #[serde(default)]
    pub explicit_environment: Option<String>,
    #[serde(default)]
    pub explicit_version_request: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RawEvent {
    pub fn new(kind: &str, git_ref: &str, actor: &str) -> Self {
        Self {
            kind: kind.to_string(),
            git_ref: git_ref.to_string(),
            actor: actor.to_string(),
            payload: serde_json::Value::Null,
            manual_flags: None,
            explicit_environment: None,
            explicit_version_request: None,
            reason: None,
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.manual_flags.as_ref().map(|f| f.emergency).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Classified trigger
// ---------------------------------------------------------------------------

/// Typed result of trigger classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    FeaturePush,
    PullRequest,
    MainPush,
    ReleaseTag,
    ManualDispatch,
    Emergency,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::FeaturePush => "feature_push",
            TriggerType::PullRequest => "pull_request",
            TriggerType::MainPush => "main_push",
            TriggerType::ReleaseTag => "release_tag",
            TriggerType::ManualDispatch => "manual_dispatch",
            TriggerType::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A release tag the classifier recognised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTag {
    /// The tag exactly as it appeared on the ref.
    pub tag: String,
    pub version: Version,
    pub kind: ReleaseKind,
}

/// Trigger type plus whatever the ref told us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub trigger_type: TriggerType,
    pub branch: Option<String>,
    pub tag: Option<ReleaseTag>,
}

impl TriggerDescriptor {
    pub fn of(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            branch: None,
            tag: None,
        }
    }
}

/// What a request is asking the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Release,
    Hotfix,
    Emergency,
    Rollback,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Deploy => "deploy",
            Operation::Release => "release",
            Operation::Hotfix => "hotfix",
            Operation::Emergency => "emergency",
            Operation::Rollback => "rollback",
        }
    }

    /// Operations that must carry a justification under the owners policy.
    pub fn requires_reason(&self) -> bool {
        matches!(
            self,
            Operation::Hotfix | Operation::Emergency | Operation::Rollback
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DeploymentRequest
// ---------------------------------------------------------------------------

/// Immutable request created on event arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub request_id: String,
    pub trigger: TriggerDescriptor,
    pub source_ref: String,
    /// Commit the request points at, when the event carried one.
    #[serde(default)]
    pub revision: Option<String>,
    pub actor: String,
    pub explicit_environment: Option<String>,
    pub explicit_version_request: Option<VersionRequest>,
    pub reason: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl DeploymentRequest {
    pub fn new(trigger: TriggerDescriptor, source_ref: &str, actor: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            source_ref: source_ref.to_string(),
            revision: None,
            actor: actor.to_string(),
            explicit_environment: None,
            explicit_version_request: None,
            reason: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.explicit_environment = Some(environment.to_string());
        self
    }

    pub fn with_version_request(mut self, request: VersionRequest) -> Self {
        self.explicit_version_request = Some(request);
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = Some(revision.to_string());
        self
    }

    /// What gets deployed when no release is cut: the commit if known,
    /// else the ref itself.
    pub fn source_revision(&self) -> &str {
        self.revision.as_deref().unwrap_or(&self.source_ref)
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type
    }

    /// Version request in effect: the caller's, else the pushed tag's version.
    pub fn version_request(&self) -> Option<VersionRequest> {
        self.explicit_version_request.clone().or_else(|| {
            self.trigger
                .tag
                .as_ref()
                .map(|t| VersionRequest::Exact(t.version.clone()))
        })
    }

    /// Derived operation; the first matching rule wins.
    pub fn operation(&self) -> Operation {
        if self.trigger.trigger_type == TriggerType::Emergency {
            return Operation::Emergency;
        }
        let tag_kind = self.trigger.tag.as_ref().map(|t| t.kind);
        if tag_kind == Some(ReleaseKind::Rollback) {
            return Operation::Rollback;
        }
        let requested_kind = self.explicit_version_request.as_ref().map(|r| r.kind());
        if tag_kind == Some(ReleaseKind::Hotfix) || requested_kind == Some(ReleaseKind::Hotfix) {
            return Operation::Hotfix;
        }
        if tag_kind.is_some() || requested_kind.is_some() {
            return Operation::Release;
        }
        Operation::Deploy
    }
}
