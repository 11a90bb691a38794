//! Podman build backend
//!
//! Build steps:
//! 1. Unpack the source bundle into the source cache (reused on a hit)
//! 2. Run the configured build command in a privileged build container on a
//!    scratch copy of the tree, with the build environment injected and the
//!    custom cache mounted
//! 3. `podman build --layers` the resulting tree into the target image

use async_trait::async_trait;
use shipway_core::error::BuildError;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::cache::{BuildCache, CacheNamespace};
use super::{BuildBackend, BuildRequest};
use crate::command::{self, CommandOutput};

/// Tag variable exposed to the build command alongside the environment
const IMAGE_TAG: &str = "IMAGE_TAG";

/// Builds images with the local podman installation
#[derive(Debug, Clone)]
pub struct PodmanBuilder {
    /// Image of the privileged build container
    build_image: String,
    /// Shell command run inside the build container, if any
    build_command: Option<String>,
    /// Dockerfile path relative to the source root
    dockerfile: String,
}

impl PodmanBuilder {
    pub fn new(
        build_image: impl Into<String>,
        build_command: Option<String>,
        dockerfile: impl Into<String>,
    ) -> Self {
        Self {
            build_image: build_image.into(),
            build_command,
            dockerfile: dockerfile.into(),
        }
    }

    /// Unpacks the source bundle, reusing a cached tree for the same content
    async fn prepare_source(
        &self,
        request: &BuildRequest<'_>,
        cache: &mut BuildCache,
    ) -> Result<(PathBuf, bool), BuildError> {
        let fingerprint = &request.source.fingerprint;

        if let Some(dir) = cache.lookup(CacheNamespace::Source, fingerprint) {
            if dir.is_dir() {
                debug!("Reusing source tree {}", dir.display());
                return Ok((dir, true));
            }
            warn!("Cached source tree {} vanished, unpacking again", dir.display());
            cache.invalidate(CacheNamespace::Source, fingerprint);
        }

        let dir = cache.entry_path(CacheNamespace::Source, fingerprint);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| compile_failure("clearing source tree", e))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| compile_failure("creating source tree", e))?;

        let bundle = dir.with_extension("tar");
        tokio::fs::write(&bundle, &request.source.content)
            .await
            .map_err(|e| compile_failure("writing source bundle", e))?;

        let bundle_path = bundle.display().to_string();
        let dir_path = dir.display().to_string();
        let output = command::run("tar", ["-xf", &bundle_path, "-C", &dir_path], None)
            .await
            .map_err(|e| BuildError::CompileFailure(format!("{:#}", e)))?;

        let _ = tokio::fs::remove_file(&bundle).await;
        ensure_success("unpacking source", &output)?;

        cache.record(CacheNamespace::Source, fingerprint, dir.clone());
        Ok((dir, false))
    }

    /// Arguments of the privileged build container run
    fn build_container_args(
        &self,
        request: &BuildRequest<'_>,
        source_dir: &Path,
        cache: &BuildCache,
        script: &str,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--privileged".to_string(),
            "-v".to_string(),
            format!("{}:/workspace:Z", source_dir.display()),
            "-v".to_string(),
            format!(
                "{}:/cache:Z",
                cache.namespace_dir(CacheNamespace::Custom).display()
            ),
            "-w".to_string(),
            "/workspace".to_string(),
        ];

        for (key, value) in request.env.iter() {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-e".to_string());
        args.push(format!("{}={}", IMAGE_TAG, request.image.tag));

        args.push(self.build_image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(script.to_string());
        args
    }

    /// Arguments of the image build
    fn image_build_args(
        &self,
        request: &BuildRequest<'_>,
        source_dir: &Path,
        cache: &BuildCache,
        layers_cached: bool,
    ) -> Vec<String> {
        let pull = if layers_cached { "missing" } else { "always" };
        let mut args = vec![
            "build".to_string(),
            "--layers".to_string(),
            format!("--pull={}", pull),
            "-f".to_string(),
            source_dir.join(&self.dockerfile).display().to_string(),
            "-t".to_string(),
            request.image.to_string(),
            "--build-arg".to_string(),
            format!("{}={}", IMAGE_TAG, request.image.tag),
        ];

        for (key, value) in request.env.iter() {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push("--volume".to_string());
        args.push(format!(
            "{}:/cache:Z",
            cache.namespace_dir(CacheNamespace::Custom).display()
        ));
        args.push(source_dir.display().to_string());
        args
    }
}

#[async_trait]
impl BuildBackend for PodmanBuilder {
    async fn build(
        &self,
        request: &BuildRequest<'_>,
        cache: &mut BuildCache,
    ) -> Result<(), BuildError> {
        for namespace in CacheNamespace::ALL {
            tokio::fs::create_dir_all(cache.namespace_dir(namespace))
                .await
                .map_err(|e| compile_failure("creating cache directory", e))?;
        }

        let (source_dir, reused) = self.prepare_source(request, cache).await?;
        info!(
            run_id = %request.run_id,
            "Source tree for {} at {} (cached: {})",
            request.commit,
            source_dir.display(),
            reused
        );

        let Some(script) = &self.build_command else {
            return self.build_image(request, cache, &source_dir).await;
        };

        // The cached tree stays pristine; the build command writes to a copy
        let scratch = scratch_copy(cache, request, &source_dir).await?;
        let result = async {
            let args = self.build_container_args(request, &scratch, cache, script);
            let output = crate::podman::podman(&args)
                .await
                .map_err(|e| BuildError::CompileFailure(format!("{:#}", e)))?;
            ensure_success("build command", &output)?;
            self.build_image(request, cache, &scratch).await
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!("Failed to remove scratch tree {}: {}", scratch.display(), e);
        }
        result
    }
}

impl PodmanBuilder {
    /// Builds the target image from a prepared context directory
    async fn build_image(
        &self,
        request: &BuildRequest<'_>,
        cache: &mut BuildCache,
        context_dir: &Path,
    ) -> Result<(), BuildError> {
        // Layer reuse is keyed by the Dockerfile contents
        let dockerfile = tokio::fs::read(context_dir.join(&self.dockerfile))
            .await
            .map_err(|e| compile_failure("reading Dockerfile", e))?;
        let layer_key = shipway_core::domain::artifact::Fingerprint::of(&dockerfile);
        let layers_cached = cache
            .lookup(CacheNamespace::DockerLayer, &layer_key)
            .is_some();

        let args = self.image_build_args(request, context_dir, cache, layers_cached);
        let output = crate::podman::podman(&args)
            .await
            .map_err(|e| BuildError::CompileFailure(format!("{:#}", e)))?;
        ensure_success("podman build", &output)?;

        let layers_dir = cache.namespace_dir(CacheNamespace::DockerLayer);
        cache.record(CacheNamespace::DockerLayer, &layer_key, layers_dir);

        info!(run_id = %request.run_id, "Built image {}", request.image);
        Ok(())
    }
}

/// Copies a source tree into a fresh per-run working directory
async fn scratch_copy(
    cache: &BuildCache,
    request: &BuildRequest<'_>,
    source_dir: &Path,
) -> Result<PathBuf, BuildError> {
    let scratch = cache.scratch_dir(request.run_id);
    if scratch.exists() {
        tokio::fs::remove_dir_all(&scratch)
            .await
            .map_err(|e| compile_failure("clearing scratch tree", e))?;
    }
    tokio::fs::create_dir_all(&scratch)
        .await
        .map_err(|e| compile_failure("creating scratch tree", e))?;

    let from = format!("{}/.", source_dir.display());
    let to = scratch.display().to_string();
    let output = command::run("cp", ["-a", from.as_str(), to.as_str()], None)
        .await
        .map_err(|e| BuildError::CompileFailure(format!("{:#}", e)))?;
    ensure_success("copying source tree", &output)?;

    debug!("Copied {} to {}", source_dir.display(), scratch.display());
    Ok(scratch)
}

fn ensure_success(step: &str, output: &CommandOutput) -> Result<(), BuildError> {
    if output.success() {
        Ok(())
    } else {
        Err(BuildError::CompileFailure(format!(
            "{}: {}",
            step,
            output.describe()
        )))
    }
}

fn compile_failure(step: &str, err: std::io::Error) -> BuildError {
    BuildError::CompileFailure(format!("{}: {}", step, err))
}
