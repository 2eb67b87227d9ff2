//! Deployment planner: project-type detection and build-policy selection.
//!
//! Detection is an ordered, first-match-wins rule list over the checkout.
//! Dockerfile synthesis never touches a repository that already ships one.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::models::ProjectType;
use crate::errors::PlanningError;

/// Vite configuration files; any of these marks a React front-end.
const VITE_CONFIGS: &[&str] = &[
    "vite.config.js",
    "vite.config.ts",
    "vite.config.mjs",
    "vite.config.cjs",
    "vite.config.mts",
];

/// Conventional server entrypoints, in the order the Node policy prefers them.
const NODE_ENTRYPOINTS: &[&str] = &["server.js", "index.js", "src/index.js"];

/// Files that mark a Node backend framework when a manifest is present.
const BACKEND_MARKERS: &[&str] = &["nest-cli.json", "angular.json", "express.js", "koa.js"];

/// Build files a repository may already carry. Their presence suppresses
/// generation entirely.
pub const DOCKERFILE_NAMES: &[&str] = &[
    "Dockerfile",
    "dockerfile",
    "Dockerfile.prod",
    "Dockerfile.production",
];

const NODE_POLICY: &str = r#"FROM node:18-alpine
WORKDIR /app
COPY package*.json ./
RUN npm ci --omit=dev
COPY . .
ENV PORT=3000
EXPOSE 3000
CMD ["node", "{entrypoint}"]
"#;

const REACT_POLICY: &str = r#"# Build stage
FROM node:18-alpine AS builder
WORKDIR /app
COPY package*.json ./
RUN npm ci
COPY . .
RUN npm run build \
    && if [ -d dist ]; then mv dist /app/out; else mv build /app/out; fi

# Serve stage
FROM nginx:alpine
COPY --from=builder /app/out /usr/share/nginx/html
EXPOSE 80
CMD ["nginx", "-g", "daemon off;"]
"#;

#[derive(Debug, Default, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    dependencies: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: HashMap<String, serde_json::Value>,
}

impl PackageManifest {
    fn depends_on(&self, name: &str) -> bool {
        self.dependencies.contains_key(name) || self.dev_dependencies.contains_key(name)
    }
}

fn read_manifest(project_path: &Path) -> Option<PackageManifest> {
    let content = std::fs::read_to_string(project_path.join("package.json")).ok()?;
    serde_json::from_str(&content).ok()
}

/// Detect the project type of a checkout.
///
/// Rules, first match wins:
/// 1. a Vite config file → React
/// 2. `package.json` listing `react` in dependencies or devDependencies → React
/// 3. a server entrypoint (`server.js`, `index.js`, `src/index.js`) → Node
/// 4. `package.json` plus a backend-framework marker file → Node
///
/// Anything else is `PlanningError::NotDetermined`; there is no default type.
pub fn detect_project_type(project_path: &Path) -> Result<ProjectType, PlanningError> {
    if VITE_CONFIGS.iter().any(|f| project_path.join(f).is_file()) {
        return Ok(ProjectType::React);
    }

    let has_manifest = project_path.join("package.json").is_file();
    if has_manifest && read_manifest(project_path).is_some_and(|m| m.depends_on("react")) {
        return Ok(ProjectType::React);
    }

    if node_entrypoint(project_path).is_some() {
        return Ok(ProjectType::Node);
    }

    if has_manifest && BACKEND_MARKERS.iter().any(|f| project_path.join(f).is_file()) {
        return Ok(ProjectType::Node);
    }

    Err(PlanningError::NotDetermined)
}

fn node_entrypoint(project_path: &Path) -> Option<&'static str> {
    NODE_ENTRYPOINTS
        .iter()
        .copied()
        .find(|f| project_path.join(f).is_file())
}

/// The first recognized build file the checkout already carries.
pub fn find_dockerfile(project_path: &Path) -> Option<&'static str> {
    DOCKERFILE_NAMES
        .iter()
        .copied()
        .find(|name| project_path.join(name).is_file())
}


/// Static table mapping a project type to its Dockerfile template.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    templates: HashMap<ProjectType, &'static str>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl PolicyTable {
    /// Node and React policies.
    pub fn standard() -> Self {
        let mut templates = HashMap::new();
        templates.insert(ProjectType::Node, NODE_POLICY);
        templates.insert(ProjectType::React, REACT_POLICY);
        Self { templates }
    }

    /// Node policy only. React projects fail planning under this table.
    pub fn node_only() -> Self {
        let mut templates = HashMap::new();
        templates.insert(ProjectType::Node, NODE_POLICY);
        Self { templates }
    }

    /// Render the Dockerfile for a project type against a checkout.
    pub fn render(
        &self,
        project_type: ProjectType,
        project_path: &Path,
    ) -> Result<String, PlanningError> {
        let template = self
            .templates
            .get(&project_type)
            .ok_or(PlanningError::Unsupported(project_type))?;

        Ok(match project_type {
            ProjectType::Node => {
                let entrypoint = node_entrypoint(project_path).unwrap_or("src/index.js");
                template.replace("{entrypoint}", entrypoint)
            }
            _ => template.to_string(),
        })
    }
}

const GENERATED_DOCKERFILE: &str = "Dockerfile";

/// What `generate_dockerfile` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerfileOutcome {
    /// The repository already had this build file; nothing was written.
    Existing(&'static str),
    /// A `Dockerfile` was synthesized from the policy table.
    Generated,
}

impl DockerfileOutcome {
    /// The build file the image must be built from.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Existing(name) => name,
            Self::Generated => GENERATED_DOCKERFILE,
        }
    }
}

/// Write a `Dockerfile` for `project_type` unless the checkout already has a
/// build file. Fails closed for any type without a policy.
pub fn generate_dockerfile(
    policies: &PolicyTable,
    project_type: ProjectType,
    project_path: &Path,
) -> Result<DockerfileOutcome, PlanningError> {
    if let Some(existing) = find_dockerfile(project_path) {
        return Ok(DockerfileOutcome::Existing(existing));
    }

    let content = policies.render(project_type, project_path)?;
    let path = project_path.join(GENERATED_DOCKERFILE);
    std::fs::write(&path, content)
        .map_err(|source| PlanningError::DockerfileWrite { path, source })?;

    Ok(DockerfileOutcome::Generated)
}
