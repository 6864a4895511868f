//! Error taxonomy for the release pipeline.
//!
//! Every variant carries a stable machine code (`code()`); its `Display`
//! is the human-readable reason.

use tierline_state::StorageError;

/// Tierline domain errors.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("version regression: {candidate} is not greater than latest {latest}")]
    VersionRegression { candidate: String, latest: String },

    #[error("authorization denied for '{actor}' on {environment}: {reason}")]
    AuthorizationDenied {
        actor: String,
        environment: String,
        reason: String,
    },

    #[error("stage {stage} timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("stage {stage} validation failed: {reason}")]
    StageValidationFailure { stage: String, reason: String },

    #[error("provisioning error in {stage}: {reason}")]
    ProvisioningError {
        stage: String,
        reason: String,
        transient: bool,
    },

    #[error("infra lock for {environment} not acquired within {waited_ms}ms")]
    LockContention { environment: String, waited_ms: u64 },

    #[error("rollback target not found: {0}")]
    RollbackTargetNotFound(String),

    #[error("run exceeded its wall-clock timeout of {timeout_ms}ms")]
    RunTimeout { timeout_ms: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Stable snake_case code for machine consumers.
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::MalformedEvent(_) => "malformed_event",
            DeployError::InvalidEnvironment(_) => "invalid_environment",
            DeployError::VersionRegression { .. } => "version_regression",
            DeployError::AuthorizationDenied { .. } => "authorization_denied",
            DeployError::StageTimeout { .. } => "stage_timeout",
            DeployError::StageValidationFailure { .. } => "stage_validation_failure",
            DeployError::ProvisioningError { .. } => "provisioning_error",
            DeployError::LockContention { .. } => "lock_contention",
            DeployError::RollbackTargetNotFound(_) => "rollback_target_not_found",
            DeployError::RunTimeout { .. } => "run_timeout",
            DeployError::Config(_) => "config_error",
            DeployError::Storage(_) => "storage_error",
            DeployError::Serialization(_) => "serialization_error",
            DeployError::Io(_) => "io_error",
        }
    }

    /// Only idempotent provisioning failures flagged transient qualify for the
    /// single bounded retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeployError::ProvisioningError {
                transient: true,
                ..
            }
        )
    }
}

/// Result type for Tierline domain operations.
pub type Result<T> = std::result::Result<T, DeployError>;
