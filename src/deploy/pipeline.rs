//! Deployment pipeline: drives one deployment from `received` to a running
//! container, or to `failed` with its workspace and image cleaned up.
//!
//! Each submitted deployment runs as its own supervised tokio task. A panic
//! inside a pipeline is caught by the supervisor and recorded as a failure;
//! it never takes down the server or other pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::lifecycle::LifecycleManager;
use super::models::{Deployment, DeploymentStatus, ProjectType, route_key};
use super::planner::{self, DockerfileOutcome, PolicyTable};
use super::runtime::ContainerRuntime;
use super::store::DeploymentStore;
use super::vcs::{self, SourceFetcher};
use crate::config::{DockhandConfig, ProxySection};
use crate::errors::DeployError;

/// Executor knobs, usually taken from `[workspace]` and `[pipeline]`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub projects_dir: PathBuf,
    pub clone_attempts: u32,
    pub clone_backoff: Duration,
    pub stop_timeout: Duration,
    pub max_concurrent: usize,
    pub prune_on_success: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &DockhandConfig) -> Self {
        Self {
            projects_dir: config.workspace.projects_dir.clone(),
            clone_attempts: config.pipeline.clone_attempts,
            clone_backoff: config.pipeline.clone_backoff(),
            stop_timeout: config.pipeline.stop_timeout(),
            max_concurrent: config.pipeline.max_concurrent,
            prune_on_success: config.workspace.prune_on_success,
        }
    }
}

/// Per-route mutexes serializing "replace the running container" for each
/// repo+branch. Different routes never contend.
#[derive(Default)]
pub struct RouteLockMap {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl RouteLockMap {
    pub fn lock_for(&self, repo_url: &str, branch: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(route_key(repo_url, branch))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Give back a lock from `lock_for`. The route's entry is dropped once no
    /// other task holds or waits on it.
    pub fn release(&self, repo_url: &str, branch: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(&route_key(repo_url, branch), |_, l| Arc::strong_count(l) == 1);
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub deployment_id: String,
    /// `container_running` or `failed`.
    pub status: DeploymentStatus,
    /// The state the pipeline was trying to reach when it failed.
    pub failed_stage: Option<DeploymentStatus>,
    pub error: Option<String>,
    pub container_id: Option<String>,
}

impl PipelineReport {
    fn succeeded(deployment_id: &str, container_id: String) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            status: DeploymentStatus::ContainerRunning,
            failed_stage: None,
            error: None,
            container_id: Some(container_id),
        }
    }

    fn failed(deployment_id: &str, failed_stage: DeploymentStatus, error: String) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            status: DeploymentStatus::Failed,
            failed_stage: Some(failed_stage),
            error: Some(error),
            container_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DeploymentStatus::ContainerRunning
    }
}

pub struct PipelineExecutor {
    fetcher: Arc<dyn SourceFetcher>,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn DeploymentStore>,
    lifecycle: LifecycleManager,
    policies: PolicyTable,
    settings: PipelineSettings,
    route_locks: RouteLockMap,
    permits: Arc<Semaphore>,
}

impl PipelineExecutor {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn DeploymentStore>,
        proxy: ProxySection,
        settings: PipelineSettings,
        policies: PolicyTable,
    ) -> Self {
        let lifecycle = LifecycleManager::new(runtime.clone(), proxy, settings.stop_timeout);
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            fetcher,
            runtime,
            store,
            lifecycle,
            policies,
            settings,
            route_locks: RouteLockMap::default(),
            permits,
        }
    }

    /// Working directory for a deployment's checkout.
    pub fn workdir_for(&self, deployment_id: &str) -> PathBuf {
        self.settings.projects_dir.join(deployment_id)
    }

    /// Run a deployment in the background.
    ///
    /// The returned handle resolves once the pipeline has finished; waiting on
    /// it is optional. Submissions beyond `max_concurrent` queue for a permit.
    pub fn submit(self: &Arc<Self>, deployment: Deployment) -> JoinHandle<PipelineReport> {
        let executor = Arc::clone(self);
        let span = info_span!("pipeline", deployment_id = %deployment.id);

        tokio::spawn(
            async move {
                let _permit = match executor.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(error = %e, "pipeline permits closed");
                        return PipelineReport::failed(
                            &deployment.id,
                            DeploymentStatus::Cloned,
                            e.to_string(),
                        );
                    }
                };

                let snapshot = deployment.clone();
                let inner = Arc::clone(&executor);
                let task = tokio::spawn(
                    async move { inner.run(deployment).await }.in_current_span(),
                );

                match task.await {
                    Ok(report) => report,
                    Err(join_err) => executor.recover_from_crash(&snapshot, join_err).await,
                }
            }
            .instrument(span),
        )
    }

    /// Drive one deployment through every stage.
    pub async fn run(&self, mut deployment: Deployment) -> PipelineReport {
        let workdir = self.workdir_for(&deployment.id);
        info!(repo = %deployment.repo_url, branch = %deployment.branch, "pipeline started");

        let mut reached = deployment.status;
        match self.drive(&mut deployment, &workdir, &mut reached).await {
            Ok(container_id) => {
                if self.settings.prune_on_success {
                    remove_workdir(&workdir).await;
                }
                info!(container_id = %container_id, "pipeline finished");
                PipelineReport::succeeded(&deployment.id, container_id)
            }
            Err(err) => {
                let failed_stage = reached.next().unwrap_or(DeploymentStatus::Failed);
                let message = err.to_string();
                error!(stage = ?failed_stage, error = %message, "pipeline failed");

                self.persist_status(&deployment.id, DeploymentStatus::Failed, Some(&message))
                    .await;
                self.compensate(&deployment, &workdir).await;
                PipelineReport::failed(&deployment.id, failed_stage, message)
            }
        }
    }

    async fn drive(
        &self,
        deployment: &mut Deployment,
        workdir: &Path,
        reached: &mut DeploymentStatus,
    ) -> Result<String, DeployError> {
        vcs::validate_repo_url(&deployment.repo_url).map_err(DeployError::UserInput)?;
        vcs::validate_branch(&deployment.branch).map_err(DeployError::UserInput)?;

        // received -> cloned
        self.clone_with_retry(deployment, workdir).await?;
        self.advance(deployment, reached, DeploymentStatus::Cloned).await;

        // cloned -> type_resolved
        if deployment.project_type == ProjectType::Unknown {
            let detected = planner::detect_project_type(workdir)?;
            info!(project_type = %detected, "project type detected");
            deployment.project_type = detected;
            if let Err(e) = self.store.set_project_type(&deployment.id, detected).await {
                warn!(error = %format!("{:#}", e), "failed to persist project type");
            }
        } else {
            debug!(project_type = %deployment.project_type, "using declared project type");
        }
        self.advance(deployment, reached, DeploymentStatus::TypeResolved)
            .await;

        // type_resolved -> dockerfile_ready
        let outcome =
            planner::generate_dockerfile(&self.policies, deployment.project_type, workdir)?;
        match outcome {
            DockerfileOutcome::Existing(name) => {
                debug!(dockerfile = name, "repository provides its own Dockerfile")
            }
            DockerfileOutcome::Generated => info!("Dockerfile generated"),
        }
        self.advance(deployment, reached, DeploymentStatus::DockerfileReady)
            .await;

        // dockerfile_ready -> image_built
        self.runtime
            .build_image(&deployment.image_name, workdir, outcome.file_name())
            .await
            .map_err(DeployError::Build)?;
        self.advance(deployment, reached, DeploymentStatus::ImageBuilt)
            .await;

        // image_built -> container_running
        let lock = self
            .route_locks
            .lock_for(&deployment.repo_url, &deployment.branch);
        let replaced = {
            let _guard = lock.lock().await;
            self.replace_container(deployment).await
        };
        self.route_locks
            .release(&deployment.repo_url, &deployment.branch, lock);
        let container_id = replaced?;
        self.advance(deployment, reached, DeploymentStatus::ContainerRunning)
            .await;

        Ok(container_id)
    }

    /// Cleanup then create+start. Callers hold the route lock.
    async fn replace_container(&self, deployment: &Deployment) -> Result<String, DeployError> {
        if let Some(replaced) = self
            .lifecycle
            .cleanup_existing(&deployment.repo_url, &deployment.branch)
            .await?
        {
            info!(container_id = %replaced, "previous container removed");
        }
        self.lifecycle
            .create_and_start(&deployment.image_name, deployment)
            .await
    }

    /// Clone with linear backoff: attempt `n` is followed by a pause of
    /// `n * clone_backoff` before the next one.
    async fn clone_with_retry(
        &self,
        deployment: &Deployment,
        workdir: &Path,
    ) -> Result<(), DeployError> {
        let attempts = self.settings.clone_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self
                .fetcher
                .fetch(&deployment.repo_url, &deployment.branch, workdir)
                .await
            {
                Ok(()) => {
                    debug!(attempt, "clone succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %format!("{:#}", e), "clone attempt failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.clone_backoff * attempt).await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow::anyhow!("clone never attempted"));
        Err(DeployError::TransientInfra(err.context(format!(
            "Clone failed after {} attempts",
            attempts
        ))))
    }

    async fn advance(
        &self,
        deployment: &mut Deployment,
        reached: &mut DeploymentStatus,
        status: DeploymentStatus,
    ) {
        debug_assert_eq!(reached.next(), Some(status));
        *reached = status;
        deployment.status = status;
        info!(stage = ?status, "stage complete");
        self.persist_status(&deployment.id, status, None).await;
    }

    async fn persist_status(&self, id: &str, status: DeploymentStatus, error: Option<&str>) {
        if let Err(e) = self.store.update_status(id, status, error).await {
            warn!(stage = ?status, error = %format!("{:#}", e), "failed to persist status");
        }
    }

    /// Undo a failed run's side effects. Failures are logged and swallowed.
    async fn compensate(&self, deployment: &Deployment, workdir: &Path) {
        remove_workdir(workdir).await;
        match self.runtime.remove_image(&deployment.image_name, true).await {
            Ok(()) => debug!(image = %deployment.image_name, "image removed"),
            Err(e) => debug!(
                image = %deployment.image_name,
                error = %format!("{:#}", e),
                "image not removed"
            ),
        }
    }

    async fn recover_from_crash(
        &self,
        deployment: &Deployment,
        join_err: tokio::task::JoinError,
    ) -> PipelineReport {
        let message = if join_err.is_panic() {
            "pipeline task panicked".to_string()
        } else {
            format!("pipeline task aborted: {}", join_err)
        };
        error!(error = %message, "pipeline crashed");

        let failed_stage = match self.store.get_deployment(&deployment.id).await {
            Ok(Some(stored)) => stored.status.next().unwrap_or(DeploymentStatus::Failed),
            _ => DeploymentStatus::Cloned,
        };
        self.persist_status(&deployment.id, DeploymentStatus::Failed, Some(&message))
            .await;
        self.compensate(deployment, &self.workdir_for(&deployment.id))
            .await;
        PipelineReport::failed(&deployment.id, failed_stage, message)
    }
}

async fn remove_workdir(workdir: &Path) {
    match tokio::fs::remove_dir_all(workdir).await {
        Ok(()) => debug!(path = %workdir.display(), "workspace removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %workdir.display(), error = %e, "failed to remove workspace"),
    }
}
