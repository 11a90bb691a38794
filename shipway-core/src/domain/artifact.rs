//! Artifact domain types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::stage::StageKind;

/// Hex-encoded SHA-256 of some content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, enough for directory names and logs
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable blob produced by one stage of a run and consumed by a later one
#[derive(Debug, Clone)]
pub struct Artifact {
    pub run_id: Uuid,
    pub name: String,
    pub producer: StageKind,
    pub content: Bytes,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(run_id: Uuid, name: impl Into<String>, producer: StageKind, content: Bytes) -> Self {
        let fingerprint = Fingerprint::of(&content);
        Self {
            run_id,
            name: name.into(),
            producer,
            content,
            fingerprint,
            created_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Fingerprint::of(b"hello");
        let b = Fingerprint::of(b"hello");
        assert_eq!(a, b);
        assert_eq!(
            a.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(a.short(), "2cf24dba5fb0");
        assert_ne!(a, Fingerprint::of(b"world"));
    }

    #[test]
    fn test_artifact_fingerprint_matches_content() {
        let artifact = Artifact::new(
            Uuid::new_v4(),
            "src:abc123",
            StageKind::Source,
            Bytes::from_static(b"bundle"),
        );
        assert_eq!(artifact.fingerprint, Fingerprint::of(b"bundle"));
        assert_eq!(artifact.size(), 6);
    }
}
