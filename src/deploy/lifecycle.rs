//! Container lifecycle: idempotent replace-on-redeploy and routing labels.
//!
//! Labels are the only link between a persisted `Deployment` and a live
//! container. A container whose `com.deployer.*` labels were altered or
//! stripped is invisible here and will not be replaced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info};

use super::models::{Deployment, LABEL_BRANCH, LABEL_DEPLOYMENT_ID, LABEL_REPO};
use super::runtime::{ContainerRuntime, ContainerSpec, ContainerSummary};
use crate::config::ProxySection;
use crate::errors::DeployError;

pub const RESTART_POLICY: &str = "unless-stopped";

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    proxy: ProxySection,
    stop_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        proxy: ProxySection,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            proxy,
            stop_timeout,
        }
    }

    /// Find the container, running or stopped, labelled with this repo+branch.
    pub async fn find_existing(
        &self,
        repo_url: &str,
        branch: &str,
    ) -> Result<Option<ContainerSummary>, DeployError> {
        let containers = self
            .runtime
            .list_containers()
            .await
            .map_err(DeployError::RuntimeState)?;

        Ok(containers.into_iter().find(|c| {
            c.label(LABEL_REPO) == Some(repo_url) && c.label(LABEL_BRANCH) == Some(branch)
        }))
    }

    /// Stop and remove the container currently serving this repo+branch, then
    /// remove the image it ran. Returns the removed container id.
    ///
    /// The image reference is read before the container is removed; after
    /// removal the runtime can no longer report it. An image that is already
    /// gone counts as removed. Any other failed step aborts so the caller
    /// never creates a second container for the same route.
    pub async fn cleanup_existing(
        &self,
        repo_url: &str,
        branch: &str,
    ) -> Result<Option<String>, DeployError> {
        let Some(existing) = self.find_existing(repo_url, branch).await? else {
            debug!(repo = %repo_url, branch = %branch, "no existing container to replace");
            return Ok(None);
        };
        let id = existing.id.clone();
        info!(container_id = %id, repo = %repo_url, branch = %branch, "replacing existing container");

        let step = async {
            self.runtime
                .stop_container(&id, self.stop_timeout)
                .await?;
            let image = self
                .runtime
                .container_image(&id)
                .await?
                .or(existing.image.clone());
            self.runtime.remove_container(&id).await?;
            if let Some(image) = image {
                self.runtime
                    .remove_image(&image, false)
                    .await
                    .with_context(|| format!("Removed container {} but not its image", id))?;
            }
            anyhow::Ok(())
        };
        step.await.map_err(DeployError::RuntimeState)?;

        Ok(Some(id))
    }

    /// The full label set for a deployment: identity labels plus the routing
    /// contract the reverse proxy reads from container metadata.
    pub fn routing_labels(&self, deployment: &Deployment) -> HashMap<String, String> {
        let router = format!("{}-router", deployment.id);
        let service = format!("{}-service", deployment.id);
        let router_key = |suffix: &str| format!("traefik.http.routers.{}.{}", router, suffix);

        let mut labels = HashMap::new();
        labels.insert(LABEL_REPO.to_string(), deployment.repo_url.clone());
        labels.insert(LABEL_BRANCH.to_string(), deployment.branch.clone());
        labels.insert(LABEL_DEPLOYMENT_ID.to_string(), deployment.id.clone());

        labels.insert("traefik.enable".to_string(), "true".to_string());
        labels.insert("traefik.docker.network".to_string(), self.proxy.network.clone());
        labels.insert(
            router_key("rule"),
            format!("Host(`{}`)", deployment.subdomain),
        );
        labels.insert(router_key("entrypoints"), self.proxy.entrypoint.clone());
        labels.insert(router_key("tls.certresolver"), self.proxy.cert_resolver.clone());
        labels.insert(router_key("service"), service.clone());
        if !self.proxy.middlewares.is_empty() {
            labels.insert(router_key("middlewares"), self.proxy.middlewares.join(","));
        }
        labels.insert(
            format!("traefik.http.services.{}.loadbalancer.server.port", service),
            deployment.project_type.service_port().to_string(),
        );

        labels
    }

    /// Create the deployment's container on the proxy network and start it.
    ///
    /// If creation fails nothing exists. If start fails the created container
    /// is left behind; the next `cleanup_existing` for the route removes it.
    pub async fn create_and_start(
        &self,
        image_name: &str,
        deployment: &Deployment,
    ) -> Result<String, DeployError> {
        let mut env: Vec<String> = deployment
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let spec = ContainerSpec {
            name: deployment.container_name.clone(),
            image: image_name.to_string(),
            labels: self.routing_labels(deployment),
            env,
            network: self.proxy.network.clone(),
            restart_policy: RESTART_POLICY.to_string(),
        };

        let id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(DeployError::RuntimeState)?;
        self.runtime
            .start_container(&id)
            .await
            .with_context(|| format!("Container {} was created but did not start", id))
            .map_err(DeployError::RuntimeState)?;

        info!(
            container_id = %id,
            deployment_id = %deployment.id,
            url = %format!("https://{}", deployment.subdomain),
            "container started"
        );
        Ok(id)
    }
}
