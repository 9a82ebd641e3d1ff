use crate::domain::AppliedHandle;
use worldswap_common::{EnvironmentId, Region};

/// Failures reported by a [`MutationAuthority`](crate::MutationAuthority).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("region {region} is outside the build limits")]
    OutOfBounds { region: Region },
    #[error("no applied snapshot for handle {0}")]
    UnknownHandle(AppliedHandle),
    #[error("host rejected the mutation: {0}")]
    Host(String),
}

/// Terminal outcome of a transition that did not commit.
///
/// Rejections (`AlreadyInProgress`, `UnknownEnvironment`, `ShuttingDown`,
/// `HistoryEmpty`) leave every piece of state untouched. The rest abort a
/// transition that had started; none of them change the current environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("a transition is already in progress")]
    AlreadyInProgress,
    #[error("unknown environment '{0}'")]
    UnknownEnvironment(EnvironmentId),
    #[error("snapshot for '{id}' unavailable: {reason}")]
    SnapshotUnavailable { id: EnvironmentId, reason: String },
    #[error("applying '{id}' failed: {source}")]
    MutationFailed {
        id: EnvironmentId,
        #[source]
        source: MutationError,
    },
    #[error("transition to '{0}' cancelled by shutdown")]
    Cancelled(EnvironmentId),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
    #[error("no previous environment to roll back to")]
    HistoryEmpty,
}

impl TransitionError {
    /// True when the request was refused before anything happened.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInProgress
                | Self::UnknownEnvironment(_)
                | Self::ShuttingDown
                | Self::HistoryEmpty
        )
    }
}

/// Failures starting a preview.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreviewError {
    #[error("unknown environment '{0}'")]
    UnknownEnvironment(EnvironmentId),
    #[error("snapshot for '{id}' unavailable: {reason}")]
    SnapshotUnavailable { id: EnvironmentId, reason: String },
    #[error("applying preview of '{id}' failed: {source}")]
    MutationFailed {
        id: EnvironmentId,
        #[source]
        source: MutationError,
    },
    #[error("preview manager is shutting down")]
    ShuttingDown,
}

/// Failures starting a [`RotationScheduler`](crate::RotationScheduler).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RotationError {
    #[error("rotation interval must be positive")]
    ZeroInterval,
}

/// Failures loading a [`SwapConfig`](crate::SwapConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why an environment cannot be swapped to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("environment id cannot be empty")]
    EmptyId,
    #[error("environment '{0}' is not configured")]
    NotConfigured(EnvironmentId),
    #[error("no snapshot stored for '{0}'")]
    NoSnapshot(EnvironmentId),
    #[error("environment '{0}' has no spawn points")]
    NoSpawnPoints(EnvironmentId),
}
