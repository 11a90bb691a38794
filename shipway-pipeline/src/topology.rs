//! Deployment topology
//!
//! Wires a configuration and a set of collaborators into a running
//! pipeline: grants the executor identities access to the registry, builds
//! the executors and creates the pipeline and its trigger listener.

use anyhow::Context;
use shipway_core::domain::grant::{Grant, Permission, Principal, Resource};
use shipway_core::domain::service::TargetService;
use shipway_core::domain::stage::StageLayout;
use shipway_core::error::GrantError;
use std::sync::Arc;
use tracing::info;

use crate::collaborator::cluster::ServiceCluster;
use crate::collaborator::registry::{GrantTarget, ImageRegistry};
use crate::collaborator::source::SourceRepository;
use crate::config::TopologyConfig;
use crate::scheduler::{Executors, Pipeline, TriggerListener};
use crate::service::binder::AccessPolicyBinder;
use crate::service::build::{BuildBackend, BuildCache, BuildExecutor};
use crate::service::deploy::DeployExecutor;

/// Establishes the grants the pipeline needs
///
/// The builder may pull and push images; the service's execution identity
/// may pull them. Safe to call repeatedly.
pub async fn bind_topology(
    binder: &AccessPolicyBinder,
    registry: &Resource,
    builder: &Principal,
    service: &TargetService,
) -> Result<Vec<Grant>, GrantError> {
    let builder_grant = binder
        .grant(builder, registry, &[Permission::Pull, Permission::Push])
        .await?;
    let execution_grant = binder
        .grant(&service.execution_identity, registry, &[Permission::Pull])
        .await?;

    Ok(vec![builder_grant, execution_grant])
}

/// A fully wired pipeline
pub struct Topology {
    pub pipeline: Arc<Pipeline>,
    pub binder: Arc<AccessPolicyBinder>,
    pub listener: Arc<TriggerListener>,
}

impl Topology {
    /// Validates the configuration, binds access and builds the pipeline
    ///
    /// # Arguments
    /// * `config` - Topology configuration
    /// * `source` - Repository commits are fetched from
    /// * `backend` - Backend that builds images
    /// * `registry` - Registry images are pushed to and pulled from
    /// * `cluster` - Cluster hosting the target service
    pub async fn assemble<R>(
        config: &TopologyConfig,
        source: Arc<dyn SourceRepository>,
        backend: Arc<dyn BuildBackend>,
        registry: Arc<R>,
        cluster: Arc<dyn ServiceCluster>,
    ) -> anyhow::Result<Self>
    where
        R: ImageRegistry + GrantTarget + 'static,
    {
        config.validate().context("Invalid topology configuration")?;

        let env = config.environment()?;
        let target = config.target_service();
        let builder = Principal::new(config.builder_principal.clone());

        let mut binder = AccessPolicyBinder::new();
        binder.register(registry.clone());
        let grants = bind_topology(&binder, &registry.resource(), &builder, &target)
            .await
            .context("Failed to bind access policy")?;
        info!("Bound {} grant(s) on {}", grants.len(), registry.resource());

        let build = BuildExecutor::new(
            backend,
            registry.clone(),
            builder,
            config.build_timeout,
            BuildCache::new(config.cache_dir()),
        );
        let deploy = DeployExecutor::new(cluster, config.deploy_timeout, config.health_poll_interval);

        let pipeline = Arc::new(Pipeline::new(
            config.pipeline_name.clone(),
            StageLayout::standard(),
            env,
            target,
            Executors {
                source,
                build: Arc::new(build),
                deploy: Arc::new(deploy),
            },
        ));
        let listener = Arc::new(TriggerListener::new(
            Arc::clone(&pipeline),
            config.branch.clone(),
        ));

        info!(
            "Pipeline {} assembled for {} on branch {}",
            config.pipeline_name, config.repository_url, config.branch
        );

        Ok(Self {
            pipeline,
            binder: Arc::new(binder),
            listener,
        })
    }
}
