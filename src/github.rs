use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::{AccountBinding, ProvisionerKind, Visibility};
use crate::credentials::CredentialResolver;

const API_BASE: &str = "https://api.github.com";

/// Why remote provisioning failed. All variants are retried on the next
/// cycle; AuthInvalid additionally surfaces at startup via verify_auth.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("authentication invalid or expired")]
    AuthInvalid,
    #[error("repository name already taken: {0}")]
    NameConflict(String),
    #[error("rate limited by hosting API")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
}

/// A remote repository that is known to exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub name: String,
    pub owner: String,
    pub remote_url: String,
}

/// Capability interface over a hosting account: does a repository exist,
/// and create one if not. Implemented by the gh CLI and by the REST API;
/// selection is per binding.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Idempotency check, always consulted before create
    async fn exists(&self, name: &str, binding: &AccountBinding) -> Result<bool, ProvisionError>;

    /// Create a repository under the binding's owner with its default
    /// visibility
    async fn create(
        &self,
        name: &str,
        description: &str,
        binding: &AccountBinding,
    ) -> Result<RemoteDescriptor, ProvisionError>;

    /// Check that the binding can authenticate at all
    async fn verify_auth(&self, binding: &AccountBinding) -> Result<(), ProvisionError>;
}

/// Ensure a remote repository exists for the binding, creating it if
/// needed. Safe to call repeatedly: an existing repository, or a
/// name-conflict race on create, both resolve to the same descriptor.
pub async fn ensure_remote(
    host: &dyn RemoteHost,
    name: &str,
    description: &str,
    binding: &AccountBinding,
) -> Result<RemoteDescriptor, ProvisionError> {
    let descriptor = RemoteDescriptor {
        name: name.to_string(),
        owner: binding.remote_owner().to_string(),
        remote_url: binding.remote_url(name),
    };

    if host.exists(name, binding).await? {
        debug!("Remote already exists: {}/{}", descriptor.owner, name);
        return Ok(descriptor);
    }

    match host.create(name, description, binding).await {
        Ok(descriptor) => {
            info!("Created remote repository: {}/{}", descriptor.owner, name);
            Ok(descriptor)
        }
        // Created between our exists check and the create call
        Err(ProvisionError::NameConflict(_)) => Ok(descriptor),
        Err(e) => Err(e),
    }
}

/// Select the provisioner implementation configured for a binding
pub fn host_for(
    kind: ProvisionerKind,
    resolver: Arc<dyn CredentialResolver>,
) -> Box<dyn RemoteHost> {
    match kind {
        ProvisionerKind::Cli => Box::new(GhCliHost::new(resolver)),
        ProvisionerKind::Api => Box::new(ApiHost::new(resolver)),
    }
}

/// Provisioner backed by the gh CLI.
///
/// The binding's token is injected as GH_TOKEN per invocation so that
/// several accounts can coexist without re-running `gh auth switch`.
pub struct GhCliHost {
    resolver: Arc<dyn CredentialResolver>,
}

impl GhCliHost {
    pub fn new(resolver: Arc<dyn CredentialResolver>) -> Self {
        Self { resolver }
    }

    fn command(&self, binding: &AccountBinding) -> AsyncCommand {
        let mut cmd = AsyncCommand::new("gh");
        if let Some(token) = binding
            .credential_ref
            .as_deref()
            .and_then(|r| self.resolver.resolve(r))
        {
            cmd.env("GH_TOKEN", token);
        }
        cmd
    }
}

#[async_trait]
impl RemoteHost for GhCliHost {
    async fn exists(&self, name: &str, binding: &AccountBinding) -> Result<bool, ProvisionError> {
        let slug = format!("{}/{}", binding.remote_owner(), name);

        let output = self
            .command(binding)
            .args(["repo", "view", &slug, "--json", "name"])
            .output()
            .await
            .map_err(|e| ProvisionError::Network(format!("failed to run gh: {}", e)))?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Could not resolve") || stderr.contains("Not Found") {
            Ok(false)
        } else {
            Err(classify_cli_error(&stderr))
        }
    }

    async fn create(
        &self,
        name: &str,
        description: &str,
        binding: &AccountBinding,
    ) -> Result<RemoteDescriptor, ProvisionError> {
        let slug = format!("{}/{}", binding.remote_owner(), name);
        let visibility_flag = match binding.visibility {
            Visibility::Private => "--private",
            Visibility::Public => "--public",
        };

        let mut cmd = self.command(binding);
        cmd.args(["repo", "create", &slug, visibility_flag]);
        if !description.is_empty() {
            cmd.args(["--description", description]);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| ProvisionError::Network(format!("failed to run gh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_cli_error(&stderr));
        }

        Ok(RemoteDescriptor {
            name: name.to_string(),
            owner: binding.remote_owner().to_string(),
            remote_url: binding.remote_url(name),
        })
    }

    async fn verify_auth(&self, binding: &AccountBinding) -> Result<(), ProvisionError> {
        let output = self
            .command(binding)
            .args(["auth", "status"])
            .output()
            .await
            .map_err(|e| ProvisionError::Network(format!("failed to run gh: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::AuthInvalid)
        }
    }
}

fn classify_cli_error(stderr: &str) -> ProvisionError {
    let lower = stderr.to_lowercase();
    if lower.contains("already exists") || lower.contains("name already exists") {
        ProvisionError::NameConflict(stderr.trim().to_string())
    } else if lower.contains("authentication")
        || lower.contains("401")
        || lower.contains("bad credentials")
        || lower.contains("gh auth login")
    {
        ProvisionError::AuthInvalid
    } else if lower.contains("rate limit") {
        ProvisionError::RateLimited
    } else {
        ProvisionError::Network(stderr.trim().to_string())
    }
}

/// Provisioner talking to the hosting REST API directly
pub struct ApiHost {
    client: reqwest::Client,
    resolver: Arc<dyn CredentialResolver>,
    api_base: String,
}

impl ApiHost {
    pub fn new(resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            client: reqwest::Client::new(),
            resolver,
            api_base: API_BASE.to_string(),
        }
    }

    fn token(&self, binding: &AccountBinding) -> Result<String, ProvisionError> {
        binding
            .credential_ref
            .as_deref()
            .and_then(|r| self.resolver.resolve(r))
            .ok_or(ProvisionError::AuthInvalid)
    }

    fn request(&self, method: reqwest::Method, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("token {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "repovault")
    }
}

#[async_trait]
impl RemoteHost for ApiHost {
    async fn exists(&self, name: &str, binding: &AccountBinding) -> Result<bool, ProvisionError> {
        let token = self.token(binding)?;
        let url = format!("{}/repos/{}/{}", self.api_base, binding.remote_owner(), name);

        let response = self
            .request(reqwest::Method::GET, &url, &token)
            .send()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(classify_status(status)),
        }
    }

    async fn create(
        &self,
        name: &str,
        description: &str,
        binding: &AccountBinding,
    ) -> Result<RemoteDescriptor, ProvisionError> {
        let token = self.token(binding)?;

        let url = match &binding.organization {
            Some(org) => format!("{}/orgs/{}/repos", self.api_base, org),
            None => format!("{}/user/repos", self.api_base),
        };

        let body = json!({
            "name": name,
            "description": description,
            "private": binding.visibility == Visibility::Private,
            "auto_init": false,
        });

        let response = self
            .request(reqwest::Method::POST, &url, &token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::CREATED {
            Ok(RemoteDescriptor {
                name: name.to_string(),
                owner: binding.remote_owner().to_string(),
                remote_url: binding.remote_url(name),
            })
        } else {
            let detail = response.text().await.unwrap_or_default();
            warn!(
                "Create repository {} failed ({}): {}",
                name,
                status,
                detail.trim()
            );
            Err(classify_status(status))
        }
    }

    async fn verify_auth(&self, binding: &AccountBinding) -> Result<(), ProvisionError> {
        let token = self.token(binding)?;
        let url = format!("{}/user", self.api_base);

        let response = self
            .request(reqwest::Method::GET, &url, &token)
            .send()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(classify_status(status)),
        }
    }
}

/// Map a hosting API status code onto the provisioning error taxonomy
fn classify_status(status: StatusCode) -> ProvisionError {
    match status {
        StatusCode::UNAUTHORIZED => ProvisionError::AuthInvalid,
        StatusCode::UNPROCESSABLE_ENTITY => {
            ProvisionError::NameConflict("name already exists on this account".to_string())
        }
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => ProvisionError::RateLimited,
        status => ProvisionError::Network(format!("unexpected status: {}", status)),
    }
}

/// Derive a repository description from the project's own files: the first
/// README prose line, a package.json description, or a generic fallback.
pub fn generate_description(path: &Path) -> String {
    if let Some(description) = readme_description(path) {
        return description;
    }

    if let Some(description) = package_json_description(path) {
        return description;
    }

    format!(
        "Auto-backed up project: {}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    )
}

fn readme_description(path: &Path) -> Option<String> {
    let entries = std::fs::read_dir(path).ok()?;
    let readme = entries
        .flatten()
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_uppercase().starts_with("README"))
        })?;

    let content = std::fs::read_to_string(readme).ok()?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(heading) = line.strip_prefix("# ") {
            return Some(heading.trim().to_string());
        }
        if !line.starts_with('#') {
            let truncated: String = line.chars().take(100).collect();
            if truncated.len() < line.len() {
                return Some(format!("{}...", truncated));
            }
            return Some(truncated);
        }
    }
    None
}

fn package_json_description(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path.join("package.json")).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&content).ok()?;
    parsed
        .get("description")
        .and_then(|d| d.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_classify_status_maps_taxonomy() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            ProvisionError::AuthInvalid
        );
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            ProvisionError::NameConflict(_)
        ));
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            ProvisionError::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ProvisionError::RateLimited
        );
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            ProvisionError::Network(_)
        ));
    }

    #[test]
    fn test_classify_cli_error() {
        assert!(matches!(
            classify_cli_error("GraphQL: Name already exists on this account"),
            ProvisionError::NameConflict(_)
        ));
        assert_eq!(
            classify_cli_error("HTTP 401: Bad credentials"),
            ProvisionError::AuthInvalid
        );
        assert_eq!(
            classify_cli_error("API rate limit exceeded"),
            ProvisionError::RateLimited
        );
        assert!(matches!(
            classify_cli_error("dial tcp: connection refused"),
            ProvisionError::Network(_)
        ));
    }

    #[test]
    fn test_description_from_readme_heading() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("README.md"),
            "# My Tool\n\nDoes useful things.\n",
        )
        .unwrap();

        assert_eq!(generate_description(temp.path()), "My Tool");
    }

    #[test]
    fn test_description_from_readme_prose() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("README.md"),
            "A small experiment in parsing.\n",
        )
        .unwrap();

        assert_eq!(
            generate_description(temp.path()),
            "A small experiment in parsing."
        );
    }

    #[test]
    fn test_description_from_package_json() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("package.json"),
            r#"{"name": "widget", "description": "Widget frontend"}"#,
        )
        .unwrap();

        assert_eq!(generate_description(temp.path()), "Widget frontend");
    }

    #[test]
    fn test_description_fallback() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("mystery");
        fs::create_dir(&project).unwrap();

        assert_eq!(
            generate_description(&project),
            "Auto-backed up project: mystery"
        );
    }
}
