use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Abstraction over source checkout for testability.
/// Real implementation: `GitCliFetcher`. Test double: `FakeFetcher`.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Shallow-clone `branch` of `repo_url` into `target_dir`. Destructive:
    /// anything already at `target_dir` is removed first.
    async fn fetch(&self, repo_url: &str, branch: &str, target_dir: &Path) -> Result<()>;
}

/// Reject repository URLs that are neither HTTP(S) nor SSH scp-style.
pub fn validate_repo_url(repo_url: &str) -> Result<(), String> {
    let ok = repo_url.starts_with("https://")
        || repo_url.starts_with("http://")
        || repo_url.starts_with("git@");
    if !ok {
        return Err(format!("invalid repository URL: {}", repo_url));
    }
    if repo_url.chars().any(char::is_whitespace) {
        return Err(format!("repository URL contains whitespace: {}", repo_url));
    }
    Ok(())
}

/// Reject branch names git would misread as options or that escape the ref
/// namespace.
pub fn validate_branch(branch: &str) -> Result<(), String> {
    if branch.is_empty()
        || branch.starts_with('-')
        || branch.contains("..")
        || branch.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(format!("invalid branch name: {:?}", branch));
    }
    Ok(())
}

/// Clones with the `git` binary on `PATH`.
#[derive(Debug, Clone)]
pub struct GitCliFetcher {
    git_cmd: String,
}

impl Default for GitCliFetcher {
    fn default() -> Self {
        Self {
            git_cmd: "git".to_string(),
        }
    }
}

impl GitCliFetcher {
    pub fn new(git_cmd: impl Into<String>) -> Self {
        Self {
            git_cmd: git_cmd.into(),
        }
    }
}

#[async_trait]
impl SourceFetcher for GitCliFetcher {
    async fn fetch(&self, repo_url: &str, branch: &str, target_dir: &Path) -> Result<()> {
        validate_repo_url(repo_url).map_err(anyhow::Error::msg)?;
        validate_branch(branch).map_err(anyhow::Error::msg)?;

        match tokio::fs::remove_dir_all(target_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to clear {}", target_dir.display()));
            }
        }
        if let Some(parent) = target_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let output = tokio::process::Command::new(&self.git_cmd)
            .args(["clone", "--depth=1", "--single-branch", "-b", branch, repo_url])
            .arg(target_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run git clone")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git clone of {}@{} failed: {}", repo_url, branch, stderr.trim());
        }
        Ok(())
    }
}
