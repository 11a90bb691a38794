//! Artifact DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::artifact::Artifact;
use crate::domain::stage::StageKind;

/// Artifact metadata without its content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub name: String,
    pub producer: StageKind,
    pub size: usize,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Artifact> for ArtifactSummary {
    fn from(artifact: &Artifact) -> Self {
        ArtifactSummary {
            name: artifact.name.clone(),
            producer: artifact.producer,
            size: artifact.size(),
            fingerprint: artifact.fingerprint.to_string(),
            created_at: artifact.created_at,
        }
    }
}
