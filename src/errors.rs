//! Typed error hierarchy for dockhand.
//!
//! Three enums cover the three failure surfaces:
//! - `DeployError`: webhook routing and pipeline stage failures
//! - `PlanningError`: project-type detection and build-policy selection
//! - `WebhookError`: request authentication before routing

use thiserror::Error;

use crate::deploy::models::ProjectType;

/// Errors from the deployment pipeline and the event router.
///
/// Variants follow the failure classes the executor reacts to: only
/// `TransientInfra` is retried (and only at the clone stage); everything else
/// fails the pipeline on first occurrence.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Invalid request: {0}")]
    UserInput(String),

    #[error("Transient infrastructure failure: {0:#}")]
    TransientInfra(#[source] anyhow::Error),

    #[error("Planning failed: {0}")]
    FatalPlanning(#[from] PlanningError),

    #[error("Image build failed: {0:#}")]
    Build(#[source] anyhow::Error),

    #[error("Container runtime state error: {0:#}")]
    RuntimeState(#[source] anyhow::Error),

    /// Persistence failures the caller cannot recover from.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the deployment planner. Never retried: rerunning detection on
/// the same checkout cannot change the outcome.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("Could not determine project type")]
    NotDetermined,

    #[error("Unsupported project type: {0}")]
    Unsupported(ProjectType),

    #[error("Failed to write Dockerfile at {path}: {source}")]
    DockerfileWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from webhook authentication.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing signature header")]
    MissingSignature,

    #[error("Signature does not match request body")]
    InvalidSignature,
}
