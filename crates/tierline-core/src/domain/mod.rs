//! Core domain types for the release pipeline.

pub mod environment;
pub mod error;
pub mod request;

pub use environment::{ApprovalPolicy, Environment, EnvironmentSet, ResourceLimits, Tier};
pub use error::{DeployError, Result};
pub use request::{
    DeploymentRequest, EventKind, ManualFlags, Operation, RawEvent, ReleaseTag,
    TriggerDescriptor, TriggerType,
};
