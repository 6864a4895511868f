//! Tierline Core Library
//!
//! The decision-making half of the release pipeline: everything that happens
//! before a stage runs, plus the boundaries to the systems stages drive.
//!
//! ## Key Components
//!
//! - `trigger`: ordered classification of inbound events
//! - `resolver`: pure environment resolution
//! - `authz`: tier-keyed authorization gate with audit trail
//! - `version`: SemVer precedence and release version planning
//! - `external`: provisioning, content, validation and notification traits,
//!   with command-backed (`command`), webhook (`notify`) and fake (`fakes`)
//!   implementations
//! - `config`: JSON configuration with environment overrides

pub mod authz;
pub mod command;
pub mod config;
pub mod domain;
pub mod external;
pub mod fakes;
pub mod metrics;
pub mod notify;
pub mod obs;
pub mod resolver;
pub mod telemetry;
pub mod trigger;
pub mod version;

pub use authz::{
    ActorEntry, ActorRegistry, AuthorizationAnswer, AuthorizationDecision, AuthorizationGate,
    AuthorizationSource, RegistryAuthorizationSource, Role,
};
pub use command::{CommandCheck, CommandContentStore, CommandProvisioningEngine, CommandSpec};
pub use config::PipelineConfig;
pub use domain::{
    ApprovalPolicy, DeployError, DeploymentRequest, Environment, EnvironmentSet, EventKind,
    ManualFlags, Operation, RawEvent, ReleaseTag, ResourceLimits, Result, Tier,
    TriggerDescriptor, TriggerType,
};
pub use external::{
    ApplyReport, Artifact, CheckContext, CheckReport, ContentStore, Convergence, ExternalError,
    ExternalResult, NotificationSink, PlanReport, ProvisioningEngine, RunSummary, StageSummary,
    SyncReport, ValidationCheck,
};
pub use metrics::METRICS;
pub use notify::{LogNotifier, WebhookNotifier};
pub use resolver::resolve_environment;
pub use telemetry::init_tracing;
pub use trigger::TriggerClassifier;
pub use version::{PlannedVersion, Version, VersionManager, VersionRequest};
