use runner_image_providers::ProviderError;
use std::time::Duration;

pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// Everything that can abort a build run.
///
/// The CLI prints `error[<category>]: <message>` and exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Invalid input detected before any cloud call.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to bootstrap shared {resource}: {message}")]
    ResourceBootstrap {
        resource: &'static str,
        message: String,
    },
    /// The VM reached an error state or could not be created.
    #[error("failed to launch builder VM: {0}")]
    Launch(String),
    #[error("builder VM {server_id} not ACTIVE after {timeout:?}")]
    LaunchTimeout { server_id: String, timeout: Duration },
    #[error("no build signal from VM {server_id} after {timeout:?}")]
    BuildTimeout { server_id: String, timeout: Duration },
    #[error("image build failed on VM {server_id}: {reason}")]
    BuildFailed { server_id: String, reason: String },
    #[error("snapshot failed: {0}")]
    Snapshot(String),
    #[error("failed to publish image to cloud {cloud}: {message}")]
    Publish { cloud: String, message: String },
    #[error("build cancelled")]
    Cancelled,
    #[error("cloud API error: {0}")]
    Provider(#[from] ProviderError),
}

impl BuildError {
    /// Stable category name shown to operators.
    pub fn category(&self) -> &'static str {
        match self {
            BuildError::Configuration(_) => "configuration",
            BuildError::ResourceBootstrap { .. } => "resource-bootstrap",
            BuildError::Launch(_) => "launch",
            BuildError::LaunchTimeout { .. } => "launch-timeout",
            BuildError::BuildTimeout { .. } => "build-timeout",
            BuildError::BuildFailed { .. } => "build-failed",
            BuildError::Snapshot(_) => "snapshot",
            BuildError::Publish { .. } => "publish",
            BuildError::Cancelled => "cancelled",
            BuildError::Provider(_) => "cloud",
        }
    }

    pub(crate) fn bootstrap(resource: &'static str, err: impl std::fmt::Display) -> Self {
        BuildError::ResourceBootstrap {
            resource,
            message: err.to_string(),
        }
    }
}

/// A stale revision that rotation could not delete. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationWarning {
    pub image_id: String,
    pub image_name: String,
    pub message: String,
}

impl std::fmt::Display for RotationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to delete old revision {} ({}): {}",
            self.image_name, self.image_id, self.message
        )
    }
}
