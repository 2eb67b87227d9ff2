//! Inbound webhook handling: signature verification and event routing.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use super::models::{Deployment, PullRequestPayload, PushPayload};
use super::pipeline::PipelineExecutor;
use super::store::DeploymentStore;
use super::vcs;
use crate::errors::{DeployError, WebhookError};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex hmac>` over the raw request body.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
/// Header naming the event type (`push`, `pull_request`, `ping`, ...).
pub const EVENT_HEADER: &str = "x-github-event";

const SUBDOMAIN_ATTEMPTS: usize = 5;

/// Check `signature_header` against an HMAC-SHA256 of the raw body.
///
/// Must run on the exact bytes received, before any JSON parsing. The
/// comparison is constant-time.
pub fn verify_signature(raw_body: &[u8], signature_header: &str, secret: &str) -> bool {
    let Some(hex_sig) = signature_header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the `sha256=<hex>` signature header value for a body.
#[cfg(test)]
pub(crate) fn sign(raw_body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(raw_body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Apply the signature policy: with no secret configured every request
/// passes; otherwise the header must be present and valid.
pub fn authenticate(
    secret: Option<&str>,
    signature_header: Option<&str>,
    raw_body: &[u8],
) -> Result<(), WebhookError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let header = signature_header.ok_or(WebhookError::MissingSignature)?;
    if verify_signature(raw_body, header, secret) {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// Synchronous reply to a webhook. The pipeline outcome is never reported
/// here; poll the deployment instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookAck {
    Accepted {
        deployment_id: String,
        subdomain: String,
    },
    Ignored {
        reason: String,
    },
    Logged {
        event: String,
    },
}

pub struct WebhookRouter {
    store: Arc<dyn DeploymentStore>,
    executor: Arc<PipelineExecutor>,
    base_domain: String,
}

impl WebhookRouter {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        executor: Arc<PipelineExecutor>,
        base_domain: impl Into<String>,
    ) -> Self {
        Self {
            store,
            executor,
            base_domain: base_domain.into(),
        }
    }

    /// Route one authenticated event.
    pub async fn handle(&self, event_type: &str, raw_body: &[u8]) -> Result<WebhookAck, DeployError> {
        match event_type {
            "push" => self.handle_push(raw_body).await,
            "pull_request" => self.handle_pull_request(raw_body),
            other => {
                info!(event = %other, "ignoring unhandled event");
                Ok(WebhookAck::Logged {
                    event: other.to_string(),
                })
            }
        }
    }

    async fn handle_push(&self, raw_body: &[u8]) -> Result<WebhookAck, DeployError> {
        let payload: PushPayload = serde_json::from_slice(raw_body)
            .map_err(|e| DeployError::UserInput(format!("malformed push payload: {}", e)))?;

        let repo_url = payload.repository.clone_url.as_str();
        vcs::validate_repo_url(repo_url).map_err(DeployError::UserInput)?;

        let Some(branch) = payload.branch() else {
            info!(git_ref = %payload.git_ref, "ignoring push to non-branch ref");
            return Ok(WebhookAck::Ignored {
                reason: format!("not a branch push: {}", payload.git_ref),
            });
        };
        if payload.deleted {
            info!(repo = %repo_url, branch = %branch, "ignoring branch deletion");
            return Ok(WebhookAck::Ignored {
                reason: format!("branch {} was deleted", branch),
            });
        }
        vcs::validate_branch(branch).map_err(DeployError::UserInput)?;

        let subdomain = self.allocate_subdomain().await;
        let mut deployment = Deployment::new(repo_url, branch, subdomain);

        match self.store.find_project_by_repo(repo_url).await {
            Ok(Some(project)) => {
                deployment.project_id = Some(project.id);
                if let Some(declared) = project.declared_type() {
                    deployment.project_type = declared;
                }
                debug!(project_id = project.id, framework = %project.framework, "push linked to project");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %format!("{:#}", e), "project lookup failed"),
        }

        if let Err(e) = self.store.insert_deployment(&deployment).await {
            error!(deployment_id = %deployment.id, error = %format!("{:#}", e), "failed to persist deployment");
            return Err(DeployError::Other(e.context("Failed to record deployment")));
        }

        info!(
            deployment_id = %deployment.id,
            repo = %repo_url,
            branch = %branch,
            commit = payload.after.as_deref().unwrap_or("-"),
            pusher = payload.pusher_email().unwrap_or("-"),
            "push accepted"
        );

        let ack = WebhookAck::Accepted {
            deployment_id: deployment.id.clone(),
            subdomain: deployment.subdomain.clone(),
        };
        // Detached: the pipeline reports through the store.
        drop(self.executor.submit(deployment));
        Ok(ack)
    }

    fn handle_pull_request(&self, raw_body: &[u8]) -> Result<WebhookAck, DeployError> {
        let payload: PullRequestPayload = serde_json::from_slice(raw_body)
            .map_err(|e| DeployError::UserInput(format!("malformed pull_request payload: {}", e)))?;

        info!(repo = %payload.repository.full_name, action = %payload.action, "pull request event");
        if payload.action == "closed" && payload.pull_request.merged {
            info!(
                number = payload.pull_request.number,
                title = %payload.pull_request.title,
                "pull request merged"
            );
        }
        Ok(WebhookAck::Logged {
            event: "pull_request".to_string(),
        })
    }

    /// A fresh `<8 hex>.<base_domain>` not held by any stored deployment.
    async fn allocate_subdomain(&self) -> String {
        let mut candidate = random_subdomain(&self.base_domain);
        for _ in 1..SUBDOMAIN_ATTEMPTS {
            match self.store.subdomain_in_use(&candidate).await {
                Ok(false) => break,
                Ok(true) => {
                    debug!(subdomain = %candidate, "subdomain collision");
                    candidate = random_subdomain(&self.base_domain);
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "subdomain check failed");
                    break;
                }
            }
        }
        candidate
    }
}

fn random_subdomain(base_domain: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}.{}", &id[..8], base_domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::models::{DeploymentStatus, ProjectType};
    use crate::deploy::planner::PolicyTable;
    use crate::deploy::testing::{
        FakeFetcher, TestStack, test_stack, test_stack_with, wait_for_terminal,
    };

    const REPO: &str = "https://example.com/app.git";
    const SECRET: &str = "It's a Secret to Everybody";

    fn router(stack: &TestStack) -> WebhookRouter {
        WebhookRouter::new(
            Arc::new(stack.store.clone()),
            stack.executor.clone(),
            "deploy.example.com",
        )
    }

    fn node_stack() -> TestStack {
        test_stack(FakeFetcher::with_files(&[
            ("package.json", r#"{"name":"api"}"#),
            ("server.js", "require('http')"),
        ]))
    }

    fn push_body(git_ref: &str) -> Vec<u8> {
        serde_json::json!({
            "ref": git_ref,
            "after": "0123abcd",
            "repository": { "clone_url": REPO },
            "pusher": { "email": "dev@example.com" }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_verify_signature_accepts_valid() {
        let body = b"Hello, World!";
        let header = sign(body, SECRET);
        assert!(verify_signature(body, &header, SECRET));
    }

    #[test]
    fn test_known_vector() {
        // Published example for x-hub-signature-256.
        assert_eq!(
            sign(b"Hello, World!", SECRET),
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
    }

    #[test]
    fn test_verify_signature_rejects_any_bit_flip() {
        let body = br#"{"ref":"refs/heads/main"}"#.to_vec();
        let header = sign(&body, SECRET);
        for i in 0..body.len() {
            for bit in 0..8 {
                let mut tampered = body.clone();
                tampered[i] ^= 1 << bit;
                assert!(!verify_signature(&tampered, &header, SECRET));
            }
        }
    }

    #[test]
    fn test_verify_signature_rejects_any_secret_bit_flip() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign(body, SECRET);
        let secret = SECRET.as_bytes();
        for i in 0..secret.len() {
            for bit in 0..7 {
                let mut flipped = secret.to_vec();
                flipped[i] ^= 1 << bit;
                let flipped = String::from_utf8(flipped).unwrap();
                assert!(!verify_signature(body, &header, &flipped), "byte {} bit {}", i, bit);
            }
        }
    }

    #[test]
    fn test_verify_signature_rejects_malformed_headers() {
        let body = b"payload";
        let header = sign(body, SECRET);
        assert!(!verify_signature(body, &header, "other secret"));
        assert!(!verify_signature(body, header.trim_start_matches("sha256="), SECRET));
        assert!(!verify_signature(body, "sha256=not-hex", SECRET));
        assert!(!verify_signature(body, "sha256=", SECRET));
        assert!(!verify_signature(body, &header.replace("sha256", "sha1"), SECRET));
    }

    #[test]
    fn test_authenticate_policy() {
        let body = b"{}";
        assert!(authenticate(None, None, body).is_ok());
        assert!(authenticate(None, Some("sha256=00"), body).is_ok());
        assert!(matches!(
            authenticate(Some(SECRET), None, body),
            Err(WebhookError::MissingSignature)
        ));
        assert!(matches!(
            authenticate(Some(SECRET), Some("sha256=00"), body),
            Err(WebhookError::InvalidSignature)
        ));
        let header = sign(body, SECRET);
        assert!(authenticate(Some(SECRET), Some(&header), body).is_ok());
    }

    #[tokio::test]
    async fn test_push_is_accepted_and_deployed() {
        let stack = node_stack();
        let ack = router(&stack)
            .handle("push", &push_body("refs/heads/main"))
            .await
            .unwrap();

        let WebhookAck::Accepted {
            deployment_id,
            subdomain,
        } = ack
        else {
            panic!("expected Accepted, got {:?}", ack);
        };
        assert!(subdomain.ends_with(".deploy.example.com"));
        assert_eq!(subdomain.split('.').next().unwrap().len(), 8);

        let stored = wait_for_terminal(&stack.store, &deployment_id).await;
        assert_eq!(stored.status, DeploymentStatus::ContainerRunning);
        assert_eq!(stored.branch, "main");
        assert_eq!(stack.runtime.running_for(REPO, "main").len(), 1);
    }

    #[tokio::test]
    async fn test_tag_and_deleted_pushes_are_ignored() {
        let stack = node_stack();
        let router = router(&stack);

        let ack = router.handle("push", &push_body("refs/tags/v1.0")).await.unwrap();
        assert!(matches!(ack, WebhookAck::Ignored { .. }));

        let mut deleted: serde_json::Value =
            serde_json::from_slice(&push_body("refs/heads/main")).unwrap();
        deleted["deleted"] = serde_json::Value::Bool(true);
        let ack = router
            .handle("push", deleted.to_string().as_bytes())
            .await
            .unwrap();
        assert!(matches!(ack, WebhookAck::Ignored { .. }));

        assert!(stack.runtime.calls().is_empty());
        assert!(
            stack
                .store
                .list_deployments_for_route(REPO, "main")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_malformed_push_is_user_input() {
        let stack = node_stack();
        let err = router(&stack).handle("push", b"{not json").await.unwrap_err();
        assert!(matches!(err, DeployError::UserInput(_)));
    }

    #[tokio::test]
    async fn test_bad_clone_url_is_user_input() {
        let stack = node_stack();
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "repository": { "clone_url": "file:///etc" }
        })
        .to_string();
        let err = router(&stack)
            .handle("push", body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::UserInput(_)));
    }

    #[tokio::test]
    async fn test_pull_request_only_logs() {
        let stack = node_stack();
        let body = serde_json::json!({
            "action": "closed",
            "pull_request": { "merged": true, "number": 7, "title": "Add login" },
            "repository": { "full_name": "owner/app" }
        })
        .to_string();
        let ack = router(&stack)
            .handle("pull_request", body.as_bytes())
            .await
            .unwrap();
        assert_eq!(
            ack,
            WebhookAck::Logged {
                event: "pull_request".into()
            }
        );
        assert!(stack.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_event_is_noop() {
        let stack = node_stack();
        let ack = router(&stack).handle("ping", b"{}").await.unwrap();
        assert_eq!(ack, WebhookAck::Logged { event: "ping".into() });
        assert!(stack.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_registered_project_declares_type() {
        // Only a Dockerfile: detection alone would fail.
        let stack = test_stack(FakeFetcher::with_files(&[("Dockerfile", "FROM scratch\n")]));
        let project = stack
            .store
            .create_project("app", REPO, "express")
            .await
            .unwrap();

        let ack = router(&stack)
            .handle("push", &push_body("refs/heads/main"))
            .await
            .unwrap();
        let WebhookAck::Accepted { deployment_id, .. } = ack else {
            panic!("expected Accepted");
        };

        let stored = wait_for_terminal(&stack.store, &deployment_id).await;
        assert_eq!(stored.project_id, Some(project.id));
        assert_eq!(stored.project_type, ProjectType::Node);
        assert_eq!(stored.status, DeploymentStatus::ContainerRunning);
    }

    #[tokio::test]
    async fn test_unrecorded_push_is_rejected_and_not_run() {
        let stack = node_stack();
        stack
            .store
            .call(|db| db.execute_raw("DROP TABLE deployments"))
            .await
            .unwrap();

        let err = router(&stack)
            .handle("push", &push_body("refs/heads/main"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Other(_)));
        assert!(err.to_string().contains("Failed to record deployment"));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(stack.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_react_dependency_push_fails_at_dockerfile_stage() {
        let stack = test_stack_with(
            FakeFetcher::with_files(&[
                ("package.json", r#"{"dependencies":{"react":"^18.2.0"}}"#),
                ("index.js", ""),
            ]),
            PolicyTable::node_only(),
        );
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "repository": { "clone_url": "https://example.com/r.git" }
        })
        .to_string();

        let ack = router(&stack).handle("push", body.as_bytes()).await.unwrap();
        let WebhookAck::Accepted { deployment_id, .. } = ack else {
            panic!("expected Accepted, got {:?}", ack);
        };

        let stored = wait_for_terminal(&stack.store, &deployment_id).await;
        assert_eq!(stored.project_type, ProjectType::React);
        assert_eq!(stored.status, DeploymentStatus::Failed);
        assert!(
            stored
                .error
                .as_deref()
                .unwrap()
                .contains("Unsupported project type: react")
        );
        assert!(stack.runtime.calls().iter().all(|c| !c.starts_with("build")));
    }

    #[test]
    fn test_ack_serialization() {
        let ack = WebhookAck::Ignored {
            reason: "not a branch push: refs/tags/v1".into(),
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], "ignored");
        assert_eq!(json["reason"], "not a branch push: refs/tags/v1");
    }
}
