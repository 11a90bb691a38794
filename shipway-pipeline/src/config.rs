//! Deployment topology configuration
//!
//! Everything needed to wire a pipeline to its repository, registry and
//! target service: names, region and account, build settings, timeouts and
//! the health-check grace period.

use anyhow::Context;
use shipway_core::domain::environment::{self, EnvironmentConfig};
use shipway_core::domain::grant::Principal;
use shipway_core::domain::image::ImageRef;
use shipway_core::domain::service::{
    ContainerDefinition, DEFAULT_HEALTH_CHECK_GRACE_SECONDS, TargetService, TaskDefinition,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Topology configuration
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Pipeline name, also used for log context
    pub pipeline_name: String,

    /// Git URL of the source repository
    pub repository_url: String,

    /// Branch whose commits trigger runs
    pub branch: String,

    /// Cloud account id, used to derive the registry host
    pub account: String,

    pub region: String,

    /// Port the application container listens on
    pub container_port: u16,

    /// Name of the application container in the task definition
    pub container_name: String,

    /// Image repository name
    pub image_name: String,

    /// Registry host; derived from account and region when unset
    pub registry_host: Option<String>,

    pub registry_tls_verify: bool,

    /// Image of the privileged build container
    pub build_image: String,

    /// Command run in the build container before the image build
    pub build_command: Option<String>,

    pub dockerfile: String,

    pub build_timeout: Duration,

    /// Limit for a whole rollout, including health checks
    pub deploy_timeout: Duration,

    /// Time new tasks get to become healthy
    pub health_check_grace: Duration,

    pub health_check_path: String,

    pub health_poll_interval: Duration,

    pub desired_count: u32,

    pub cluster_name: String,

    pub service_name: String,

    /// Image the service runs before its first deploy
    pub initial_image: String,

    /// How often to poll the repository for new commits
    pub poll_interval: Duration,

    /// Directory for the repository mirror and build caches
    pub workspace_base: PathBuf,

    /// Stable external endpoint name of the service
    pub endpoint: Option<String>,

    /// Identity builds push images as
    pub builder_principal: String,

    /// Identity the cluster pulls service images as
    pub execution_principal: String,
}

impl TopologyConfig {
    /// Creates a configuration with defaults
    pub fn new(repository_url: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            pipeline_name: "veengu".to_string(),
            repository_url: repository_url.into(),
            branch: "main".to_string(),
            account: account.into(),
            region: "us-west-2".to_string(),
            container_port: 8080,
            container_name: "web".to_string(),
            image_name: "veengu-back".to_string(),
            registry_host: None,
            registry_tls_verify: true,
            build_image: "quay.io/podman/stable:latest".to_string(),
            build_command: None,
            dockerfile: "Dockerfile".to_string(),
            build_timeout: Duration::from_secs(30 * 60),
            deploy_timeout: Duration::from_secs(15 * 60),
            health_check_grace: Duration::from_secs(DEFAULT_HEALTH_CHECK_GRACE_SECONDS),
            health_check_path: "/".to_string(),
            health_poll_interval: Duration::from_secs(5),
            desired_count: 1,
            cluster_name: "veengu".to_string(),
            service_name: "veengu-service".to_string(),
            initial_image: "public.ecr.aws/amazonlinux/amazonlinux:latest".to_string(),
            poll_interval: Duration::from_secs(60),
            workspace_base: PathBuf::from("/tmp/shipway"),
            endpoint: None,
            builder_principal: "shipway-builder".to_string(),
            execution_principal: "shipway-execution".to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - SHIPWAY_REPOSITORY_URL (required)
    /// - SHIPWAY_ACCOUNT_ID (required)
    /// - SHIPWAY_PIPELINE, SHIPWAY_BRANCH, SHIPWAY_REGION (optional)
    /// - SHIPWAY_CONTAINER_PORT, SHIPWAY_CONTAINER_NAME, SHIPWAY_IMAGE_NAME (optional)
    /// - SHIPWAY_REGISTRY_HOST, SHIPWAY_REGISTRY_TLS_VERIFY (optional)
    /// - SHIPWAY_BUILD_IMAGE, SHIPWAY_BUILD_COMMAND, SHIPWAY_DOCKERFILE (optional)
    /// - SHIPWAY_BUILD_TIMEOUT, SHIPWAY_DEPLOY_TIMEOUT (optional, seconds)
    /// - SHIPWAY_HEALTH_CHECK_GRACE (optional, seconds, default: 60)
    /// - SHIPWAY_HEALTH_CHECK_PATH, SHIPWAY_HEALTH_POLL_INTERVAL (optional)
    /// - SHIPWAY_DESIRED_COUNT, SHIPWAY_CLUSTER, SHIPWAY_SERVICE (optional)
    /// - SHIPWAY_INITIAL_IMAGE, SHIPWAY_POLL_INTERVAL (optional)
    /// - SHIPWAY_WORKSPACE, SHIPWAY_ENDPOINT (optional)
    /// - SHIPWAY_BUILDER_PRINCIPAL, SHIPWAY_EXECUTION_PRINCIPAL (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let repository_url = lookup("SHIPWAY_REPOSITORY_URL")
            .ok_or_else(|| anyhow::anyhow!("SHIPWAY_REPOSITORY_URL environment variable not set"))?;

        let account = lookup("SHIPWAY_ACCOUNT_ID")
            .ok_or_else(|| anyhow::anyhow!("SHIPWAY_ACCOUNT_ID environment variable not set"))?;

        let mut config = Self::new(repository_url, account);

        let string = |key: &str, target: &mut String| {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        };
        string("SHIPWAY_PIPELINE", &mut config.pipeline_name);
        string("SHIPWAY_BRANCH", &mut config.branch);
        string("SHIPWAY_REGION", &mut config.region);
        string("SHIPWAY_CONTAINER_NAME", &mut config.container_name);
        string("SHIPWAY_IMAGE_NAME", &mut config.image_name);
        string("SHIPWAY_BUILD_IMAGE", &mut config.build_image);
        string("SHIPWAY_DOCKERFILE", &mut config.dockerfile);
        string("SHIPWAY_HEALTH_CHECK_PATH", &mut config.health_check_path);
        string("SHIPWAY_CLUSTER", &mut config.cluster_name);
        string("SHIPWAY_SERVICE", &mut config.service_name);
        string("SHIPWAY_INITIAL_IMAGE", &mut config.initial_image);
        string("SHIPWAY_BUILDER_PRINCIPAL", &mut config.builder_principal);
        string("SHIPWAY_EXECUTION_PRINCIPAL", &mut config.execution_principal);

        config.registry_host = lookup("SHIPWAY_REGISTRY_HOST");
        config.build_command = lookup("SHIPWAY_BUILD_COMMAND");
        config.endpoint = lookup("SHIPWAY_ENDPOINT");

        if let Some(workspace) = lookup("SHIPWAY_WORKSPACE") {
            config.workspace_base = PathBuf::from(workspace);
        }

        if let Some(port) = lookup("SHIPWAY_CONTAINER_PORT") {
            config.container_port = port
                .parse()
                .with_context(|| format!("Invalid SHIPWAY_CONTAINER_PORT '{}'", port))?;
        }

        if let Some(verify) = lookup("SHIPWAY_REGISTRY_TLS_VERIFY") {
            config.registry_tls_verify = !matches!(verify.as_str(), "0" | "false" | "no");
        }

        if let Some(count) = lookup("SHIPWAY_DESIRED_COUNT") {
            config.desired_count = count
                .parse()
                .with_context(|| format!("Invalid SHIPWAY_DESIRED_COUNT '{}'", count))?;
        }

        let seconds = |key: &str, target: &mut Duration| -> anyhow::Result<()> {
            if let Some(value) = lookup(key) {
                let secs = value
                    .parse::<u64>()
                    .with_context(|| format!("Invalid {} '{}'", key, value))?;
                *target = Duration::from_secs(secs);
            }
            Ok(())
        };
        seconds("SHIPWAY_BUILD_TIMEOUT", &mut config.build_timeout)?;
        seconds("SHIPWAY_DEPLOY_TIMEOUT", &mut config.deploy_timeout)?;
        seconds("SHIPWAY_HEALTH_CHECK_GRACE", &mut config.health_check_grace)?;
        seconds("SHIPWAY_HEALTH_POLL_INTERVAL", &mut config.health_poll_interval)?;
        seconds("SHIPWAY_POLL_INTERVAL", &mut config.poll_interval)?;

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("pipeline_name", &self.pipeline_name),
            ("repository_url", &self.repository_url),
            ("branch", &self.branch),
            ("account", &self.account),
            ("region", &self.region),
            ("container_name", &self.container_name),
            ("image_name", &self.image_name),
            ("cluster_name", &self.cluster_name),
            ("service_name", &self.service_name),
            ("builder_principal", &self.builder_principal),
            ("execution_principal", &self.execution_principal),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
        }

        if self.container_port == 0 {
            anyhow::bail!("container_port must be greater than 0");
        }

        if self.desired_count == 0 {
            anyhow::bail!("desired_count must be greater than 0");
        }

        if self.build_timeout.is_zero() {
            anyhow::bail!("build_timeout must be greater than 0");
        }

        if self.deploy_timeout <= self.health_check_grace {
            anyhow::bail!("deploy_timeout must be longer than health_check_grace");
        }

        if self.poll_interval.is_zero() || self.health_poll_interval.is_zero() {
            anyhow::bail!("poll intervals must be greater than 0");
        }

        if !self.health_check_path.starts_with('/') {
            anyhow::bail!("health_check_path must start with /");
        }

        ImageRef::parse(&self.initial_image)
            .with_context(|| "initial_image must be a fully qualified image reference")?;

        Ok(())
    }

    /// Registry host images are pushed to
    pub fn registry_host(&self) -> String {
        self.registry_host
            .clone()
            .unwrap_or_else(|| ImageRef::ecr_host(&self.account, &self.region))
    }

    /// Environment injected into every build
    pub fn environment(&self) -> anyhow::Result<EnvironmentConfig> {
        EnvironmentConfig::for_deployment(
            &self.account,
            &self.region,
            self.container_port,
            &self.container_name,
            &self.image_name,
            &self.registry_host(),
        )
        .context("Invalid build environment")
    }

    /// The service deploys roll out to, as it looks before the first deploy
    pub fn target_service(&self) -> TargetService {
        TargetService {
            cluster: self.cluster_name.clone(),
            name: self.service_name.clone(),
            task_definition: TaskDefinition {
                family: self.service_name.clone(),
                revision: 1,
                container: ContainerDefinition {
                    name: self.container_name.clone(),
                    image: self.initial_image.clone(),
                    port: self.container_port,
                    environment: BTreeMap::from([(
                        environment::CONTAINER_PORT.to_string(),
                        self.container_port.to_string(),
                    )]),
                },
            },
            desired_count: self.desired_count,
            execution_identity: Principal::new(self.execution_principal.clone()),
            health_check_grace_seconds: self.health_check_grace.as_secs(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Directory of the bare repository mirror
    pub fn mirror_dir(&self) -> PathBuf {
        self.workspace_base.join("mirror.git")
    }

    /// Root of the build cache namespaces
    pub fn cache_dir(&self) -> PathBuf {
        self.workspace_base.join("cache")
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::new("https://example.com/veengu/backend.git", "123456789012")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TopologyConfig::default();
        assert_eq!(config.region, "us-west-2");
        assert_eq!(config.health_check_grace, Duration::from_secs(60));
        assert_eq!(
            config.registry_host(),
            "123456789012.dkr.ecr.us-west-2.amazonaws.com"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TopologyConfig::default();

        config.container_port = 0;
        assert!(config.validate().is_err());
        config.container_port = 8080;

        config.image_name = String::new();
        assert!(config.validate().is_err());
        config.image_name = "veengu-back".to_string();

        config.deploy_timeout = Duration::from_secs(30);
        assert!(config.validate().is_err());
        config.deploy_timeout = Duration::from_secs(600);

        config.initial_image = "amazonlinux".to_string();
        assert!(config.validate().is_err());
        config.initial_image = "localhost/amazonlinux:latest".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_account_is_required_with_explicit_registry_host() {
        let mut config = TopologyConfig::default();
        config.registry_host = Some("localhost:5000".to_string());
        config.account = String::new();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("account"));
    }

    #[test]
    fn test_from_lookup() {
        let config = TopologyConfig::from_lookup(lookup(&[
            ("SHIPWAY_REPOSITORY_URL", "https://git.example.com/app.git"),
            ("SHIPWAY_ACCOUNT_ID", "acct"),
            ("SHIPWAY_CONTAINER_PORT", "9000"),
            ("SHIPWAY_HEALTH_CHECK_GRACE", "90"),
            ("SHIPWAY_REGISTRY_HOST", "localhost:5000"),
            ("SHIPWAY_REGISTRY_TLS_VERIFY", "false"),
        ]))
        .unwrap();

        assert_eq!(config.container_port, 9000);
        assert_eq!(config.health_check_grace, Duration::from_secs(90));
        assert_eq!(config.registry_host(), "localhost:5000");
        assert!(!config.registry_tls_verify);
        assert_eq!(config.branch, "main");
    }

    #[test]
    fn test_from_lookup_requires_repository() {
        let result = TopologyConfig::from_lookup(lookup(&[("SHIPWAY_ACCOUNT_ID", "acct")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let result = TopologyConfig::from_lookup(lookup(&[
            ("SHIPWAY_REPOSITORY_URL", "https://git.example.com/app.git"),
            ("SHIPWAY_ACCOUNT_ID", "acct"),
            ("SHIPWAY_BUILD_TIMEOUT", "soon"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_environment_has_deployment_keys() {
        let env = TopologyConfig::default().environment().unwrap();
        assert_eq!(env.len(), 6);
        assert_eq!(env.get(environment::IMAGE_NAME), Some("veengu-back"));
        assert_eq!(env.get(environment::CONTAINER_NAME), Some("web"));
    }

    #[test]
    fn test_target_service() {
        let service = TopologyConfig::default().target_service();
        assert_eq!(service.health_check_grace_seconds, 60);
        assert_eq!(service.container_name(), "web");
        assert_eq!(service.execution_identity.as_str(), "shipway-execution");
    }
}
