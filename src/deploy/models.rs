use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Label carrying the repository clone URL of a managed container.
pub const LABEL_REPO: &str = "com.deployer.repo";
/// Label carrying the branch of a managed container.
pub const LABEL_BRANCH: &str = "com.deployer.branch";
/// Label carrying the deployment id that created a managed container.
pub const LABEL_DEPLOYMENT_ID: &str = "com.deployer.deployment-id";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Node,
    React,
    /// Not pre-declared; the planner resolves it from the checkout.
    #[default]
    Unknown,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::React => "react",
            Self::Unknown => "unknown",
        }
    }

    /// Port the generated image listens on. Node services bind 3000; everything
    /// else is served by a static web server on 80.
    pub fn service_port(&self) -> u16 {
        match self {
            Self::Node => 3000,
            _ => 80,
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "node" | "nodejs" | "express" => Ok(Self::Node),
            "react" | "vite" => Ok(Self::React),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(format!("Invalid project type: {}", other)),
        }
    }
}

/// Pipeline lifecycle state. Transitions only move forward; `Failed` may be
/// entered from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Received,
    Cloned,
    TypeResolved,
    DockerfileReady,
    ImageBuilt,
    ContainerRunning,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Cloned => "cloned",
            Self::TypeResolved => "type_resolved",
            Self::DockerfileReady => "dockerfile_ready",
            Self::ImageBuilt => "image_built",
            Self::ContainerRunning => "container_running",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ContainerRunning | Self::Failed)
    }

    /// The state reached by completing the stage after this one.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Received => Some(Self::Cloned),
            Self::Cloned => Some(Self::TypeResolved),
            Self::TypeResolved => Some(Self::DockerfileReady),
            Self::DockerfileReady => Some(Self::ImageBuilt),
            Self::ImageBuilt => Some(Self::ContainerRunning),
            Self::ContainerRunning | Self::Failed => None,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "cloned" => Ok(Self::Cloned),
            "type_resolved" => Ok(Self::TypeResolved),
            "dockerfile_ready" => Ok(Self::DockerfileReady),
            "image_built" => Ok(Self::ImageBuilt),
            "container_running" => Ok(Self::ContainerRunning),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// One attempt to build and run a repo+branch as a routable service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub repo_url: String,
    pub branch: String,
    pub subdomain: String,
    pub project_type: ProjectType,
    pub container_name: String,
    pub image_name: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub status: DeploymentStatus,
    pub error: Option<String>,
    /// Lookup-only reference to the owning project, if one is registered for
    /// the repository. The deployment never owns the project.
    pub project_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Deployment {
    /// Build a fresh `Received` deployment for a repo+branch.
    ///
    /// The container name is derived from a stable hash of the route so that
    /// operators can recognize every generation of the same repo+branch, with
    /// a short id suffix to keep names unique across generations.
    pub fn new(repo_url: &str, branch: &str, subdomain: String) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            container_name: format!("dh-{}-{}", route_key_hash(repo_url, branch), &id[..8]),
            image_name: image_name_for(&id),
            id,
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
            subdomain,
            project_type: ProjectType::Unknown,
            env: HashMap::new(),
            status: DeploymentStatus::Received,
            error: None,
            project_id: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Deterministic image tag for a deployment id.
pub fn image_name_for(deployment_id: &str) -> String {
    format!("{}-image", deployment_id)
}

pub fn route_key(repo_url: &str, branch: &str) -> String {
    format!("{}#{}", repo_url, branch)
}

fn route_key_hash(repo_url: &str, branch: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(route_key(repo_url, branch).as_bytes());
    hex::encode(digest)[..12].to_string()
}

// ── Webhook payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    pub repository: PushRepository,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub pusher: Option<Pusher>,
    /// Set when the push deleted the ref.
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub clone_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    #[serde(default)]
    pub email: Option<String>,
}

impl PushPayload {
    /// Branch name for `refs/heads/*` refs; `None` for tags and other refs.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref
            .strip_prefix("refs/heads/")
            .filter(|b| !b.is_empty())
    }

    pub fn pusher_email(&self) -> Option<&str> {
        self.pusher.as_ref().and_then(|p| p.email.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
    #[serde(default)]
    pub action: String,
    pub pull_request: PullRequestInfo,
    pub repository: PullRequestRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestInfo {
    #[serde(default)]
    pub merged: bool,
    pub number: i64,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestRepository {
    pub full_name: String,
}

// ── Externally owned records ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub github_repo: String,
    pub project_name: String,
    pub framework: String,
}

impl Project {
    /// Project type declared by the project's framework, if it names one the
    /// planner has a build policy for.
    pub fn declared_type(&self) -> Option<ProjectType> {
        match self.framework.parse::<ProjectType>() {
            Ok(ProjectType::Unknown) | Err(_) => None,
            Ok(t) => Some(t),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub projects: Vec<i64>,
}
