//! Stage error taxonomy
//!
//! Each executor reports its own error type. The engine wraps them in
//! [`StageError`] and records the flattened [`ErrorKind`] on the run, which is
//! what monitors and the API see.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::grant::{Principal, Resource};

/// Failure fetching a commit from the source repository
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("commit not found: {0}")]
    NotFound(String),

    #[error("access denied to source repository: {0}")]
    AccessDenied(String),
}

/// Failure building or publishing an image
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("build failed: {0}")]
    CompileFailure(String),

    #[error("image push failed: {0}")]
    ImagePushFailure(String),

    #[error("build exceeded timeout of {0:?}")]
    Timeout(Duration),
}

/// Failure rolling a new image out to the target service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("image pull denied: {0}")]
    ImagePullDenied(String),

    #[error("task {task} not healthy after grace period of {grace:?}")]
    HealthCheckTimeout { task: String, grace: Duration },

    #[error("rollout failed: {0}")]
    RolloutFailed(String),
}

/// Failure establishing a grant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantError {
    #[error("{principal} is not authorized to be granted access on {resource}: {reason}")]
    Unauthorized {
        principal: Principal,
        resource: Resource,
        reason: String,
    },
}

/// Error raised while a run occupies a stage
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("required artifact '{0}' is missing")]
    MissingArtifact(String),

    #[error("run was cancelled")]
    Cancelled,
}

impl StageError {
    /// Flattened kind recorded on the run
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Source(SourceError::NotFound(_)) => ErrorKind::NotFound,
            StageError::Source(SourceError::AccessDenied(_)) => ErrorKind::AccessDenied,
            StageError::Build(BuildError::CompileFailure(_)) => ErrorKind::CompileFailure,
            StageError::Build(BuildError::ImagePushFailure(_)) => ErrorKind::ImagePushFailure,
            StageError::Build(BuildError::Timeout(_)) => ErrorKind::Timeout,
            StageError::Deploy(DeployError::ImagePullDenied(_)) => ErrorKind::ImagePullDenied,
            StageError::Deploy(DeployError::HealthCheckTimeout { .. }) => {
                ErrorKind::HealthCheckTimeout
            }
            StageError::Deploy(DeployError::RolloutFailed(_)) => ErrorKind::RolloutFailed,
            StageError::MissingArtifact(_) => ErrorKind::MissingArtifact,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Serializable error kind, one per leaf of the taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    CompileFailure,
    ImagePushFailure,
    Timeout,
    ImagePullDenied,
    HealthCheckTimeout,
    RolloutFailed,
    MissingArtifact,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AccessDenied => "AccessDenied",
            ErrorKind::CompileFailure => "CompileFailure",
            ErrorKind::ImagePushFailure => "ImagePushFailure",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ImagePullDenied => "ImagePullDenied",
            ErrorKind::HealthCheckTimeout => "HealthCheckTimeout",
            ErrorKind::RolloutFailed => "RolloutFailed",
            ErrorKind::MissingArtifact => "MissingArtifact",
            ErrorKind::Cancelled => "Cancelled",
        };
        write!(f, "{}", name)
    }
}
