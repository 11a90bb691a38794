//! Artifact store
//!
//! Holds the immutable artifacts each run produces, scoped by run. An
//! artifact is written once by the stage that produces it and read by the
//! stages that consume it; a run never sees another run's artifacts.

use shipway_core::domain::artifact::Artifact;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactStoreError {
    #[error("artifact '{name}' already exists for run {run_id}")]
    AlreadyExists { run_id: Uuid, name: String },
}

/// In-memory artifact store shared by all stages
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    inner: Arc<RwLock<HashMap<Uuid, HashMap<String, Artifact>>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an artifact
    ///
    /// # Errors
    /// Fails if the run already has an artifact with the same name; artifacts
    /// are never overwritten.
    pub fn put(&self, artifact: Artifact) -> Result<(), ArtifactStoreError> {
        let mut runs = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let artifacts = runs.entry(artifact.run_id).or_default();

        if artifacts.contains_key(&artifact.name) {
            return Err(ArtifactStoreError::AlreadyExists {
                run_id: artifact.run_id,
                name: artifact.name,
            });
        }

        debug!(
            "Stored artifact {} for run {} ({} bytes, {})",
            artifact.name,
            artifact.run_id,
            artifact.size(),
            artifact.fingerprint.short()
        );
        artifacts.insert(artifact.name.clone(), artifact);
        Ok(())
    }

    pub fn get(&self, run_id: Uuid, name: &str) -> Option<Artifact> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
            .and_then(|artifacts| artifacts.get(name))
            .cloned()
    }

    pub fn contains(&self, run_id: Uuid, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
            .is_some_and(|artifacts| artifacts.contains_key(name))
    }

    /// Artifacts of a run, oldest first
    pub fn list(&self, run_id: Uuid) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
            .map(|artifacts| artifacts.values().cloned().collect())
            .unwrap_or_default();
        artifacts.sort_by_key(|a| a.created_at);
        artifacts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shipway_core::domain::stage::StageKind;

    fn artifact(run_id: Uuid, name: &str) -> Artifact {
        Artifact::new(run_id, name, StageKind::Source, Bytes::from_static(b"bundle"))
    }

    #[test]
    fn test_put_and_get() {
        let store = ArtifactStore::new();
        let run_id = Uuid::new_v4();

        store.put(artifact(run_id, "src:abc123")).unwrap();

        assert!(store.contains(run_id, "src:abc123"));
        let stored = store.get(run_id, "src:abc123").unwrap();
        assert_eq!(stored.content, Bytes::from_static(b"bundle"));
    }

    #[test]
    fn test_artifacts_are_immutable() {
        let store = ArtifactStore::new();
        let run_id = Uuid::new_v4();

        store.put(artifact(run_id, "src:abc123")).unwrap();
        let result = store.put(artifact(run_id, "src:abc123"));

        assert!(matches!(result, Err(ArtifactStoreError::AlreadyExists { .. })));
    }

    #[test]
    fn test_runs_are_isolated() {
        let store = ArtifactStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store.put(artifact(first, "src:abc123")).unwrap();

        assert!(!store.contains(second, "src:abc123"));
        assert!(store.list(second).is_empty());
        assert_eq!(store.list(first).len(), 1);
    }
}
