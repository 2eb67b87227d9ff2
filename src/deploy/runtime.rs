use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HostConfig, NetworkingConfig, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};

/// A container as reported by the runtime's list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub image: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Everything needed to create a managed container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub network: String,
    pub restart_policy: String,
}

/// Abstraction over the container runtime for testability.
/// Real implementation: `DockerRuntime`. Test double: `FakeRuntime`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List every container, running or stopped.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Image reference the container was created from.
    async fn container_image(&self, container_id: &str) -> Result<Option<String>>;

    /// Stop a container, letting the runtime kill it after `timeout`.
    async fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Remove an image. An image that is already gone counts as removed.
    async fn remove_image(&self, image: &str, force: bool) -> Result<()>;

    /// Build `context_dir` into an image tagged `tag`, reading the build
    /// instructions from `dockerfile` (relative to `context_dir`).
    async fn build_image(&self, tag: &str, context_dir: &Path, dockerfile: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;
}

/// Docker Engine runtime.
///
/// Container and image operations go through the Engine API via `bollard`.
/// Image builds shell out to `docker build` so the daemon reads the build
/// context straight from disk.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    docker_cmd: String,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the default socket)
    /// and verify the daemon answers.
    pub async fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        docker
            .ping()
            .await
            .context("Docker daemon did not respond to ping")?;
        Ok(Self {
            docker,
            docker_cmd: "docker".to_string(),
        })
    }
}

fn restart_policy_name(name: &str) -> RestartPolicyNameEnum {
    match name {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::UNLESS_STOPPED,
    }
}

/// Seconds for the Engine's `t` parameter, saturating at `i32::MAX`.
fn stop_timeout_secs(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptionsBuilder::default().all(true).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image: c.image,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn container_image(&self, container_id: &str) -> Result<Option<String>> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", container_id))?;
        Ok(info.config.and_then(|c| c.image).or(info.image))
    }

    async fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptionsBuilder::default()
            .t(stop_timeout_secs(timeout))
            .build();
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to stop container {}", container_id))
            }
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default().build();
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .with_context(|| format!("Failed to remove container {}", container_id))
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        let options = RemoveImageOptionsBuilder::default().force(force).build();
        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => Ok(()),
            // 404: already removed
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove image {}", image)),
        }
    }

    async fn build_image(&self, tag: &str, context_dir: &Path, dockerfile: &str) -> Result<()> {
        let output = tokio::process::Command::new(&self.docker_cmd)
            .arg("build")
            .arg("-t")
            .arg(tag)
            .arg("-f")
            .arg(context_dir.join(dockerfile))
            .arg(context_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run docker build")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            anyhow::bail!(
                "docker build -t {} exited with {}: {}",
                tag,
                output.status,
                tail.join("\n")
            );
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();

        let mut endpoints = HashMap::new();
        endpoints.insert(spec.network.clone(), EndpointSettings::default());

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(restart_policy_name(&spec.restart_policy)),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(endpoints),
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", container_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_names() {
        assert_eq!(
            restart_policy_name("unless-stopped"),
            RestartPolicyNameEnum::UNLESS_STOPPED
        );
        assert_eq!(restart_policy_name("always"), RestartPolicyNameEnum::ALWAYS);
        assert_eq!(restart_policy_name("bogus"), RestartPolicyNameEnum::UNLESS_STOPPED);
    }

    #[test]
    fn test_stop_timeout_saturates() {
        assert_eq!(stop_timeout_secs(Duration::from_secs(30)), 30);
        assert_eq!(stop_timeout_secs(Duration::from_millis(1500)), 1);
        assert_eq!(stop_timeout_secs(Duration::from_secs(u64::MAX)), i32::MAX);
        assert_eq!(stop_timeout_secs(Duration::from_secs(1 << 31)), i32::MAX);
    }

    #[test]
    fn test_summary_label_lookup() {
        let mut labels = HashMap::new();
        labels.insert("com.deployer.branch".to_string(), "main".to_string());
        let summary = ContainerSummary {
            id: "abc".into(),
            image: Some("img".into()),
            labels,
        };
        assert_eq!(summary.label("com.deployer.branch"), Some("main"));
        assert_eq!(summary.label("com.deployer.repo"), None);
    }
}
