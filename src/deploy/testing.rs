//! In-memory test doubles for the runtime and fetcher traits.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::models::{LABEL_BRANCH, LABEL_REPO};
use super::runtime::{ContainerRuntime, ContainerSpec, ContainerSummary};
use super::vcs::SourceFetcher;

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    calls: Vec<String>,
    failing: HashSet<String>,
    next_id: u32,
}

/// Container runtime that keeps containers and images in memory and records
/// every call as `"<op>:<target>"`.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn seed_container(&self, id: &str, image: &str, repo: &str, branch: &str, running: bool) {
        let mut labels = HashMap::new();
        labels.insert(LABEL_REPO.to_string(), repo.to_string());
        labels.insert(LABEL_BRANCH.to_string(), branch.to_string());
        let mut state = self.state.lock().unwrap();
        state.images.insert(image.to_string());
        state.containers.insert(
            id.to_string(),
            FakeContainer {
                spec: ContainerSpec {
                    name: id.to_string(),
                    image: image.to_string(),
                    labels,
                    env: Vec::new(),
                    network: "test-net".to_string(),
                    restart_policy: "unless-stopped".to_string(),
                },
                running,
            },
        );
    }

    pub fn seed_image(&self, image: &str) {
        self.state.lock().unwrap().images.insert(image.to_string());
    }

    /// Make every subsequent call of `op` fail (`list`, `inspect`, `stop`,
    /// `remove_container`, `remove_image`, `build`, `create`, `start`).
    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.state.lock().unwrap().containers.contains_key(id)
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains(image)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .is_some_and(|c| c.running)
    }

    pub fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.spec.clone())
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    /// Ids of running containers labelled with this repo+branch.
    pub fn running_for(&self, repo: &str, branch: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, c)| {
                c.running
                    && c.spec.labels.get(LABEL_REPO).map(String::as_str) == Some(repo)
                    && c.spec.labels.get(LABEL_BRANCH).map(String::as_str) == Some(branch)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn record(&self, op: &str, target: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if target.is_empty() {
            state.calls.push(op.to_string());
        } else {
            state.calls.push(format!("{}:{}", op, target));
        }
        if state.failing.contains(op) {
            anyhow::bail!("injected {} failure", op);
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.record("list", "")?;
        let state = self.state.lock().unwrap();
        let mut out: Vec<ContainerSummary> = state
            .containers
            .iter()
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                image: Some(c.spec.image.clone()),
                labels: c.spec.labels.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn container_image(&self, container_id: &str) -> Result<Option<String>> {
        self.record("inspect", container_id)?;
        let state = self.state.lock().unwrap();
        match state.containers.get(container_id) {
            Some(c) => Ok(Some(c.spec.image.clone())),
            None => anyhow::bail!("no such container: {}", container_id),
        }
    }

    async fn stop_container(&self, container_id: &str, _timeout: Duration) -> Result<()> {
        self.record("stop", container_id)?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(container_id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => anyhow::bail!("no such container: {}", container_id),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.record("remove_container", container_id)?;
        let mut state = self.state.lock().unwrap();
        if state.containers.get(container_id).is_some_and(|c| c.running) {
            anyhow::bail!("container {} is running", container_id);
        }
        state
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", container_id))
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        self.record("remove_image", image)?;
        let mut state = self.state.lock().unwrap();
        let in_use = state.containers.values().any(|c| c.spec.image == image);
        if in_use && !force && state.images.contains(image) {
            anyhow::bail!("image {} is in use", image);
        }
        state.images.remove(image);
        Ok(())
    }

    async fn build_image(&self, tag: &str, context_dir: &Path, dockerfile: &str) -> Result<()> {
        self.record("build", &format!("{} -f {}", tag, dockerfile))?;
        if !context_dir.join(dockerfile).is_file() {
            anyhow::bail!("failed to read {} in {}", dockerfile, context_dir.display());
        }
        self.state.lock().unwrap().images.insert(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record("create", &spec.name)?;
        let mut state = self.state.lock().unwrap();
        if !state.images.contains(&spec.image) {
            anyhow::bail!("no such image: {}", spec.image);
        }
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            anyhow::bail!("container name {} already in use", spec.name);
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.record("start", container_id)?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(container_id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => anyhow::bail!("no such container: {}", container_id),
        }
    }
}

/// Fetcher that materializes a fixed file set instead of cloning.
pub struct FakeFetcher {
    files: Vec<(String, String)>,
    fail_first: u32,
    attempts: AtomicU32,
}

impl FakeFetcher {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            fail_first: 0,
            attempts: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` attempts, then succeed.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing() -> Self {
        Self::with_files(&[]).failing_first(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, repo_url: &str, branch: &str, target_dir: &Path) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if tokio::fs::metadata(target_dir).await.is_ok() {
            tokio::fs::remove_dir_all(target_dir).await?;
        }
        tokio::fs::create_dir_all(target_dir).await?;
        if attempt <= self.fail_first {
            anyhow::bail!("clone of {}@{} refused (attempt {})", repo_url, branch, attempt);
        }
        for (rel, content) in &self.files {
            let path = target_dir.join(rel);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, content).await?;
        }
        Ok(())
    }
}

/// Executor wired to fakes and an in-memory store, with zero clone backoff.
pub struct TestStack {
    pub executor: std::sync::Arc<super::pipeline::PipelineExecutor>,
    pub runtime: std::sync::Arc<FakeRuntime>,
    pub store: super::store::DbHandle,
    pub projects: tempfile::TempDir,
}

pub fn test_stack(fetcher: FakeFetcher) -> TestStack {
    test_stack_with(fetcher, super::planner::PolicyTable::standard())
}

pub fn test_stack_with(fetcher: FakeFetcher, policies: super::planner::PolicyTable) -> TestStack {
    use super::pipeline::{PipelineExecutor, PipelineSettings};
    use std::sync::Arc;

    let projects = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let store = super::store::DbHandle::in_memory().unwrap();
    let settings = PipelineSettings {
        projects_dir: projects.path().to_path_buf(),
        clone_attempts: 3,
        clone_backoff: Duration::ZERO,
        stop_timeout: Duration::from_secs(1),
        max_concurrent: 4,
        prune_on_success: true,
    };
    let executor = Arc::new(PipelineExecutor::new(
        Arc::new(fetcher),
        runtime.clone(),
        Arc::new(store.clone()),
        crate::config::ProxySection::default(),
        settings,
        policies,
    ));
    TestStack {
        executor,
        runtime,
        store,
        projects,
    }
}

/// Poll the store until the deployment reaches a terminal status.
pub async fn wait_for_terminal(
    store: &super::store::DbHandle,
    id: &str,
) -> super::models::Deployment {
    use super::store::DeploymentStore;

    for _ in 0..500 {
        if let Some(d) = store.get_deployment(id).await.unwrap() {
            if d.status.is_terminal() {
                return d;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("deployment {} never reached a terminal status", id);
}
