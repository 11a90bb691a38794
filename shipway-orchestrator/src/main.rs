//! Shipway Orchestrator
//!
//! Runs one continuous-deployment pipeline and exposes it over HTTP.
//!
//! Startup:
//! - Configuration: `SHIPWAY_*` environment variables
//! - Collaborators: git mirror, podman builder, registry and cluster
//! - Topology: access grants, executors, pipeline and trigger listener
//! - Background: the commit poller feeding the trigger listener
//! - HTTP: run inspection, manual triggers, commit webhooks, cancellation

pub mod api;

use anyhow::{Context, Result};
use shipway_pipeline::collaborator::{GitPoller, GitSource, PodmanCluster, PodmanRegistry};
use shipway_pipeline::service::build::PodmanBuilder;
use shipway_pipeline::{Topology, TopologyConfig, podman};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "shipway_orchestrator=info,shipway_pipeline=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Shipway Orchestrator...");

    let config = TopologyConfig::from_env().context("Failed to load configuration")?;
    config.validate()?;
    info!(
        "Pipeline {} following {}@{} (registry: {})",
        config.pipeline_name,
        config.repository_url,
        config.branch,
        config.registry_host()
    );

    podman::check_podman_available().await?;

    // Collaborators
    let git = Arc::new(GitSource::new(
        config.repository_url.clone(),
        config.mirror_dir(),
    ));
    sync_with_retry(&git).await?;

    let registry = Arc::new(PodmanRegistry::new(
        config.image_name.clone(),
        config.registry_tls_verify,
    ));
    let cluster = Arc::new(
        PodmanCluster::new(registry.clone(), config.health_check_path.clone())
            .context("Failed to create cluster client")?,
    );
    let builder = Arc::new(PodmanBuilder::new(
        config.build_image.clone(),
        config.build_command.clone(),
        config.dockerfile.clone(),
    ));

    let topology = Topology::assemble(&config, git.clone(), builder, registry, cluster).await?;
    info!("Topology assembled");

    let shutdown = CancellationToken::new();

    // Commit poller
    let poller = GitPoller::new(git, config.branch.clone(), None);
    let listener = Arc::clone(&topology.listener);
    let poll_interval = config.poll_interval;
    let poller_shutdown = shutdown.clone();
    let poller_task = tokio::spawn(async move {
        if let Err(e) = listener.watch(poller, poll_interval, poller_shutdown).await {
            error!("Commit poller error: {:#}", e);
        }
    });

    // HTTP API
    let app = api::create_router(api::AppState::from(&topology));
    let addr = std::env::var("SHIPWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    info!("Listening on {}", addr);

    let tcp = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = poller_task.await {
        warn!("Commit poller task ended abnormally: {}", e);
    }

    info!("Shipway Orchestrator stopped");
    Ok(())
}

/// Cancels the token on Ctrl-C
async fn shutdown_on_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    shutdown.cancel();
}

/// Mirrors the repository, retrying with exponential backoff
///
/// The git host may not be reachable yet when the orchestrator starts.
async fn sync_with_retry(git: &GitSource) -> Result<()> {
    const MAX_RETRIES: u32 = 5;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match git.sync().await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Repository mirrored after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) if attempt >= MAX_RETRIES => {
                return Err(anyhow::anyhow!(
                    "Failed to mirror repository after {} attempts: {}",
                    MAX_RETRIES,
                    e
                ));
            }
            Err(e) => {
                warn!(
                    "Failed to mirror repository (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
