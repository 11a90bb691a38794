//! Build executor
//!
//! Turns a source artifact into a published container image and an image
//! definitions document for the deploy stage. Builds run one at a time: the
//! cache is locked for the whole build-and-push section so two runs never
//! interleave inside it.

pub mod cache;
pub mod podman;

use async_trait::async_trait;
use bytes::Bytes;
use shipway_core::domain::artifact::Artifact;
use shipway_core::domain::environment::{self, EnvironmentConfig};
use shipway_core::domain::grant::Principal;
use shipway_core::domain::image::{ImageDefinition, ImageRef};
use shipway_core::domain::run::CommitRef;
use shipway_core::error::BuildError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborator::registry::ImageRegistry;

pub use cache::{BuildCache, CacheNamespace, CacheStats};
pub use podman::PodmanBuilder;

/// Everything a backend needs to produce one image
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub run_id: Uuid,
    pub commit: &'a CommitRef,
    pub source: &'a Artifact,
    pub env: &'a EnvironmentConfig,
    /// Tag the backend must give the local image
    pub image: &'a ImageRef,
}

/// Produces a local image from a source bundle
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Builds and tags `request.image` locally
    ///
    /// Every key of `request.env` must be visible to the build process.
    async fn build(
        &self,
        request: &BuildRequest<'_>,
        cache: &mut BuildCache,
    ) -> Result<(), BuildError>;
}

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub image: ImageRef,
    /// Image definitions JSON consumed by the deploy stage
    pub content: Bytes,
}

/// Build executor
pub struct BuildExecutor {
    backend: Arc<dyn BuildBackend>,
    registry: Arc<dyn ImageRegistry>,
    principal: Principal,
    timeout: Duration,
    cache: Mutex<BuildCache>,
}

impl BuildExecutor {
    /// Creates a build executor
    ///
    /// # Arguments
    /// * `backend` - Backend that builds images
    /// * `registry` - Registry images are pushed to
    /// * `principal` - Identity used for the push
    /// * `timeout` - Limit for build and push together
    /// * `cache` - Cache shared by all builds of this executor
    pub fn new(
        backend: Arc<dyn BuildBackend>,
        registry: Arc<dyn ImageRegistry>,
        principal: Principal,
        timeout: Duration,
        cache: BuildCache,
    ) -> Self {
        Self {
            backend,
            registry,
            principal,
            timeout,
            cache: Mutex::new(cache),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Current cache statistics
    ///
    /// Waits for a running build to finish.
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    /// Builds and publishes the image for a commit
    ///
    /// Nothing is returned for the artifact store until the push completed,
    /// so a failed or timed out build never yields a deployable artifact.
    pub async fn build(
        &self,
        run_id: Uuid,
        commit: &CommitRef,
        source: &Artifact,
        env: &EnvironmentConfig,
    ) -> Result<BuildOutput, BuildError> {
        let image = target_image(commit, env)?;
        let container_name = required(env, environment::CONTAINER_NAME)?;

        let mut cache = self.cache.lock().await;
        info!(
            run_id = %run_id,
            "Building {} for {} (source {})",
            image,
            commit,
            source.fingerprint.short()
        );

        let request = BuildRequest {
            run_id,
            commit,
            source,
            env,
            image: &image,
        };

        let work = async {
            self.backend.build(&request, &mut cache).await?;
            self.registry
                .push(&self.principal, &image)
                .await
                .map_err(|e| BuildError::ImagePushFailure(e.to_string()))
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(run_id = %run_id, "Build of {} failed: {}", commit, e);
                return Err(e);
            }
            Err(_) => {
                warn!(
                    run_id = %run_id,
                    "Build of {} exceeded {:?}",
                    commit, self.timeout
                );
                return Err(BuildError::Timeout(self.timeout));
            }
        }
        drop(cache);

        let definitions = vec![ImageDefinition {
            name: container_name.to_string(),
            image_uri: image.to_string(),
        }];
        let content = serde_json::to_vec(&definitions)
            .map_err(|e| BuildError::CompileFailure(format!("image definitions: {}", e)))?;

        info!(run_id = %run_id, "Published {}", image);

        Ok(BuildOutput {
            image,
            content: Bytes::from(content),
        })
    }
}

/// Image reference a commit is published under, tagged with the commit id
pub fn target_image(commit: &CommitRef, env: &EnvironmentConfig) -> Result<ImageRef, BuildError> {
    let host = required(env, environment::REGISTRY_HOST)?;
    let name = required(env, environment::IMAGE_NAME)?;
    Ok(ImageRef::new(host, name, commit.commit_id.clone()))
}

fn required<'a>(env: &'a EnvironmentConfig, key: &str) -> Result<&'a str, BuildError> {
    env.get(key).ok_or_else(|| {
        BuildError::CompileFailure(format!("build environment is missing {}", key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvironmentConfig {
        EnvironmentConfig::for_deployment(
            "acct",
            "us-west-2",
            8080,
            "web",
            "veengu-back",
            &ImageRef::ecr_host("acct", "us-west-2"),
        )
        .unwrap()
    }

    #[test]
    fn test_target_image_is_tagged_with_commit() {
        let image = target_image(&CommitRef::new("main", "abc123"), &env()).unwrap();
        assert_eq!(
            image.to_string(),
            "acct.dkr.ecr.us-west-2.amazonaws.com/veengu-back:abc123"
        );
    }

    #[test]
    fn test_target_image_requires_registry_host() {
        let env = EnvironmentConfig::new([(environment::IMAGE_NAME, "app")]).unwrap();
        let result = target_image(&CommitRef::new("main", "abc123"), &env);
        assert!(matches!(result, Err(BuildError::CompileFailure(_))));
    }
}
