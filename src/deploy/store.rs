use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Persistence for deployment, project and user records.
///
/// The store is the source of truth for deployments; the container runtime
/// only mirrors it through labels.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>>;

    /// Record a status transition, with the failure message for `Failed`.
    async fn update_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn set_project_type(&self, id: &str, project_type: ProjectType) -> Result<()>;

    async fn subdomain_in_use(&self, subdomain: &str) -> Result<bool>;

    /// Most recent deployments for a repo+branch, newest first.
    async fn list_deployments_for_route(
        &self,
        repo_url: &str,
        branch: &str,
    ) -> Result<Vec<Deployment>>;

    async fn create_project(
        &self,
        project_name: &str,
        github_repo: &str,
        framework: &str,
    ) -> Result<Project>;

    async fn find_project_by_repo(&self, github_repo: &str) -> Result<Option<Project>>;

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User>;

    async fn get_user(&self, id: i64) -> Result<Option<User>>;

    /// Append a project reference to a user's project list.
    async fn add_project_to_user(&self, user_id: i64, project_id: i64) -> Result<()>;
}

/// Async-safe handle to the deployment database.
///
/// Wraps `DeployDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<DeployDb>>,
}

impl DbHandle {
    pub fn new(db: DeployDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file, creating its parent directory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        Ok(Self::new(DeployDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(DeployDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DeployDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct DeployDb {
    conn: Connection,
}

impl DeployDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    github_repo TEXT NOT NULL,
                    project_name TEXT NOT NULL,
                    framework TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS user_projects (
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    PRIMARY KEY (user_id, project_id)
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id TEXT PRIMARY KEY,
                    repo_url TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    subdomain TEXT NOT NULL UNIQUE,
                    project_type TEXT NOT NULL DEFAULT 'unknown',
                    container_name TEXT NOT NULL,
                    image_name TEXT NOT NULL,
                    env TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'received',
                    error TEXT,
                    project_id INTEGER REFERENCES projects(id) ON DELETE SET NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_projects_repo ON projects(github_repo);
                CREATE INDEX IF NOT EXISTS idx_deployments_route ON deployments(repo_url, branch);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn insert_deployment(&self, d: &Deployment) -> Result<()> {
        let env = serde_json::to_string(&d.env).context("Failed to encode deployment env")?;
        self.conn
            .execute(
                "INSERT INTO deployments (id, repo_url, branch, subdomain, project_type,
                    container_name, image_name, env, status, error, project_id,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    d.id,
                    d.repo_url,
                    d.branch,
                    d.subdomain,
                    d.project_type.as_str(),
                    d.container_name,
                    d.image_name,
                    env,
                    d.status.as_str(),
                    d.error,
                    d.project_id,
                    d.created_at,
                    d.updated_at,
                ],
            )
            .with_context(|| format!("Failed to insert deployment {}", d.id))?;
        Ok(())
    }

    const DEPLOYMENT_COLUMNS: &'static str = "id, repo_url, branch, subdomain, project_type,
        container_name, image_name, env, status, error, project_id, created_at, updated_at";

    fn row_to_deployment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deployment> {
        let project_type: String = row.get(4)?;
        let env: String = row.get(7)?;
        let status: String = row.get(8)?;
        Ok(Deployment {
            id: row.get(0)?,
            repo_url: row.get(1)?,
            branch: row.get(2)?,
            subdomain: row.get(3)?,
            project_type: project_type.parse().unwrap_or_default(),
            container_name: row.get(5)?,
            image_name: row.get(6)?,
            env: serde_json::from_str::<HashMap<String, String>>(&env).unwrap_or_default(),
            status: status.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(
                    8,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            error: row.get(9)?,
            project_id: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE id = ?1",
            Self::DEPLOYMENT_COLUMNS
        );
        self.conn
            .query_row(&sql, params![id], Self::row_to_deployment)
            .optional()
            .context("Failed to query deployment")
    }

    pub fn list_deployments_for_route(
        &self,
        repo_url: &str,
        branch: &str,
    ) -> Result<Vec<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE repo_url = ?1 AND branch = ?2
             ORDER BY created_at DESC, rowid DESC",
            Self::DEPLOYMENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![repo_url, branch], Self::row_to_deployment)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list deployments")?;
        Ok(rows)
    }

    pub fn update_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE deployments SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), error, chrono::Utc::now().to_rfc3339(), id],
            )
            .context("Failed to update deployment status")?;
        if changed == 0 {
            anyhow::bail!("Deployment {} not found", id);
        }
        Ok(())
    }

    pub fn set_project_type(&self, id: &str, project_type: ProjectType) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE deployments SET project_type = ?1, updated_at = ?2 WHERE id = ?3",
                params![project_type.as_str(), chrono::Utc::now().to_rfc3339(), id],
            )
            .context("Failed to update deployment type")?;
        if changed == 0 {
            anyhow::bail!("Deployment {} not found", id);
        }
        Ok(())
    }

    pub fn subdomain_in_use(&self, subdomain: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM deployments WHERE subdomain = ?1",
                params![subdomain],
                |row| row.get(0),
            )
            .context("Failed to query subdomain")?;
        Ok(count > 0)
    }

    pub fn create_project(
        &self,
        project_name: &str,
        github_repo: &str,
        framework: &str,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (github_repo, project_name, framework) VALUES (?1, ?2, ?3)",
                params![github_repo, project_name, framework],
            )
            .context("Failed to insert project")?;
        Ok(Project {
            id: self.conn.last_insert_rowid(),
            github_repo: github_repo.to_string(),
            project_name: project_name.to_string(),
            framework: framework.to_string(),
        })
    }

    pub fn find_project_by_repo(&self, github_repo: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, github_repo, project_name, framework FROM projects
                 WHERE github_repo = ?1 ORDER BY id DESC LIMIT 1",
                params![github_repo],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        github_repo: row.get(1)?,
                        project_name: row.get(2)?,
                        framework: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
                params![username, password_hash],
            )
            .with_context(|| format!("Failed to insert user {}", username))?;
        Ok(User {
            id: self.conn.last_insert_rowid(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            projects: Vec::new(),
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, username, password_hash FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        projects: Vec::new(),
                    })
                },
            )
            .optional()
            .context("Failed to query user")?;

        let Some(mut user) = user else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare(
            "SELECT project_id FROM user_projects WHERE user_id = ?1 ORDER BY rowid",
        )?;
        user.projects = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to list user projects")?;
        Ok(Some(user))
    }

    pub fn add_project_to_user(&self, user_id: i64, project_id: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO user_projects (user_id, project_id) VALUES (?1, ?2)",
                params![user_id, project_id],
            )
            .with_context(|| {
                format!("Failed to add project {} to user {}", project_id, user_id)
            })?;
        Ok(())
    }
}

#[cfg(test)]
impl DeployDb {
    /// Run raw SQL, for putting the schema into states the API never produces.
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for DbHandle {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<()> {
        let deployment = deployment.clone();
        self.call(move |db| db.insert_deployment(&deployment)).await
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let id = id.to_string();
        self.call(move |db| db.get_deployment(&id)).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let id = id.to_string();
        let error = error.map(str::to_string);
        self.call(move |db| db.update_status(&id, status, error.as_deref()))
            .await
    }

    async fn set_project_type(&self, id: &str, project_type: ProjectType) -> Result<()> {
        let id = id.to_string();
        self.call(move |db| db.set_project_type(&id, project_type))
            .await
    }

    async fn subdomain_in_use(&self, subdomain: &str) -> Result<bool> {
        let subdomain = subdomain.to_string();
        self.call(move |db| db.subdomain_in_use(&subdomain)).await
    }

    async fn list_deployments_for_route(
        &self,
        repo_url: &str,
        branch: &str,
    ) -> Result<Vec<Deployment>> {
        let repo_url = repo_url.to_string();
        let branch = branch.to_string();
        self.call(move |db| db.list_deployments_for_route(&repo_url, &branch))
            .await
    }

    async fn create_project(
        &self,
        project_name: &str,
        github_repo: &str,
        framework: &str,
    ) -> Result<Project> {
        let (name, repo, framework) = (
            project_name.to_string(),
            github_repo.to_string(),
            framework.to_string(),
        );
        self.call(move |db| db.create_project(&name, &repo, &framework))
            .await
    }

    async fn find_project_by_repo(&self, github_repo: &str) -> Result<Option<Project>> {
        let repo = github_repo.to_string();
        self.call(move |db| db.find_project_by_repo(&repo)).await
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let (username, hash) = (username.to_string(), password_hash.to_string());
        self.call(move |db| db.create_user(&username, &hash)).await
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.call(move |db| db.get_user(id)).await
    }

    async fn add_project_to_user(&self, user_id: i64, project_id: i64) -> Result<()> {
        self.call(move |db| db.add_project_to_user(user_id, project_id))
            .await
    }
}
