//! Podman helpers
//!
//! Shared podman invocations for the build backend, the registry and the
//! local cluster:
//! - Checking podman availability
//! - Starting detached containers with published ports
//! - Inspecting, stopping and removing containers

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::command::{self, CommandOutput};

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<()> {
    let output = command::run("podman", ["--version"], None)
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.success() {
        anyhow::bail!("Podman is not working correctly: {}", output.describe());
    }

    info!("Podman is available: {}", output.stdout_str());

    Ok(())
}

/// Runs `podman` with the given arguments
pub async fn podman<I, S>(args: I) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    command::run("podman", args, None).await
}

/// Options for a detached service container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub container_port: u16,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Starts a detached container publishing its port on a random host port
///
/// Returns the container ID.
pub async fn run_detached(spec: &ContainerSpec) -> Result<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "-p".to_string(),
        format!("127.0.0.1::{}", spec.container_port),
    ];

    for (key, value) in &spec.environment {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());

    let output = podman(&args).await?;
    if !output.success() {
        anyhow::bail!(
            "Failed to start container {} from {}: {}",
            spec.name,
            spec.image,
            output.describe()
        );
    }

    let container_id = output.stdout_str();
    info!(
        "Container {} started from {} with ID: {}",
        spec.name, spec.image, container_id
    );

    Ok(container_id)
}

/// Host port a container port is published on
pub async fn host_port(container: &str, container_port: u16) -> Result<u16> {
    let output = podman(["port", container, &container_port.to_string()]).await?;
    if !output.success() {
        anyhow::bail!(
            "Failed to look up port {} of {}: {}",
            container_port,
            container,
            output.describe()
        );
    }

    parse_host_port(&output.stdout_str())
        .with_context(|| format!("Unexpected `podman port` output for {}", container))
}

/// Parses the first line of `podman port` output, e.g. `127.0.0.1:41234`
fn parse_host_port(output: &str) -> Result<u16> {
    let line = output
        .lines()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty output"))?;
    let (_, port) = line
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("missing port in '{}'", line))?;
    port.trim()
        .parse::<u16>()
        .with_context(|| format!("invalid port '{}'", port))
}

/// Whether a container is still running
pub async fn is_running(container: &str) -> Result<bool> {
    let output = podman(["inspect", "-f", "{{.State.Running}}", container]).await?;
    if !output.success() {
        return Ok(false);
    }
    Ok(output.stdout_str() == "true")
}

/// Stops and removes a container, ignoring containers that are already gone
pub async fn remove(container: &str) -> Result<()> {
    debug!("Stopping container {}", container);

    // Stop container (ignore errors if already stopped)
    let _ = podman(["stop", "-t", "10", container]).await;

    let output = podman(["rm", "-f", container]).await?;
    if output.success() {
        debug!("Container {} removed", container);
    } else {
        warn!(
            "Failed to remove container {}: {}",
            container,
            output.stderr.trim()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("127.0.0.1:41234").unwrap(), 41234);
        assert_eq!(
            parse_host_port("0.0.0.0:8081\n[::]:8081").unwrap(),
            8081
        );
    }

    #[test]
    fn test_parse_host_port_rejects_garbage() {
        assert!(parse_host_port("").is_err());
        assert!(parse_host_port("no-port-here").is_err());
        assert!(parse_host_port("127.0.0.1:http").is_err());
    }
}
