//! Unified configuration for dockhand.
//!
//! Settings come from `dockhand.toml` (every key optional) and are then
//! overridden by environment variables, which may themselves come from a
//! `.env` file loaded through `dotenvy`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "dockhand.toml";

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for local front-end development.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

/// Webhook authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookSection {
    /// Shared HMAC secret. When unset, signatures are not checked.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Where checkouts live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
    /// Remove a deployment's checkout once its container is running.
    #[serde(default = "default_prune_workspace")]
    pub prune_on_success: bool,
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from("/projects")
}

fn default_prune_workspace() -> bool {
    true
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            projects_dir: default_projects_dir(),
            prune_on_success: default_prune_workspace(),
        }
    }
}

/// Routing-label contract with the reverse proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    /// Shared network the proxy and every deployed container join.
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,
    #[serde(default = "default_middlewares")]
    pub middlewares: Vec<String>,
}

fn default_base_domain() -> String {
    "deploy.localhost".to_string()
}

fn default_network() -> String {
    "traefik_traefik-net".to_string()
}

fn default_entrypoint() -> String {
    "websecure".to_string()
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

fn default_middlewares() -> Vec<String> {
    vec![
        "secure-headers@docker".to_string(),
        "compress@docker".to_string(),
    ]
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            network: default_network(),
            entrypoint: default_entrypoint(),
            cert_resolver: default_cert_resolver(),
            middlewares: default_middlewares(),
        }
    }
}

/// Pipeline retry, timeout and concurrency knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_clone_attempts")]
    pub clone_attempts: u32,
    /// Base backoff between clone attempts; attempt `n` waits `n` times this.
    #[serde(default = "default_clone_backoff_secs")]
    pub clone_backoff_secs: u64,
    /// Grace period before the runtime kills a container being replaced.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Pipelines allowed to run at once; further submissions queue.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_clone_attempts() -> u32 {
    3
}

fn default_clone_backoff_secs() -> u64 {
    2
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            clone_attempts: default_clone_attempts(),
            clone_backoff_secs: default_clone_backoff_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl PipelineSection {
    pub fn clone_backoff(&self) -> Duration {
        Duration::from_secs(self.clone_backoff_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".dockhand/dockhand.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rotated log files here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Root of `dockhand.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockhandConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl DockhandConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dockhand.toml")
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from file, then apply `.env` and process environment overrides.
    pub fn resolve(path: &Path) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup("DOCKHAND_WEBHOOK_SECRET").filter(|s| !s.is_empty()) {
            self.webhook.secret = Some(secret);
        }
        if let Some(domain) = lookup("DOCKHAND_BASE_DOMAIN") {
            self.proxy.base_domain = domain;
        }
        if let Some(network) = lookup("DOCKHAND_PROXY_NETWORK") {
            self.proxy.network = network;
        }
        if let Some(dir) = lookup("DOCKHAND_PROJECTS_DIR") {
            self.workspace.projects_dir = PathBuf::from(dir);
        }
        if let Some(db) = lookup("DOCKHAND_DB_PATH") {
            self.store.db_path = PathBuf::from(db);
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize dockhand.toml")
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.webhook.secret.is_none() {
            warnings.push(
                "webhook.secret is not set: webhook signatures will not be verified".to_string(),
            );
        }
        if self.pipeline.clone_attempts == 0 {
            warnings.push("pipeline.clone_attempts is 0: every clone will fail".to_string());
        }
        if self.pipeline.max_concurrent == 0 {
            warnings.push("pipeline.max_concurrent is 0: treated as 1".to_string());
        }
        if self.proxy.base_domain.trim().is_empty() || self.proxy.base_domain.contains('/') {
            warnings.push(format!(
                "Invalid proxy.base_domain '{}': should be a bare hostname",
                self.proxy.base_domain
            ));
        }
        if !self.workspace.projects_dir.is_absolute() {
            warnings.push(format!(
                "workspace.projects_dir '{}' is relative to the working directory",
                self.workspace.projects_dir.display()
            ));
        }

        warnings
    }
}
