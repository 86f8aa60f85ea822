//! Shared fixtures for end-to-end tests.
//!
//! Remote hosting is replaced by bare repositories on the local
//! filesystem so that real pushes happen without any network.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use repovault::config::{AccountBinding, Config};
use repovault::github::{ProvisionError, RemoteDescriptor, RemoteHost};

/// A hosting account backed by a directory of bare repositories.
/// `create` runs `git init --bare`, so pushes against the returned
/// remote URL are real.
pub struct LocalBareHost {
    remotes_dir: PathBuf,
    created: Mutex<Vec<String>>,
}

impl LocalBareHost {
    pub fn new(remotes_dir: impl Into<PathBuf>) -> Self {
        let remotes_dir = remotes_dir.into();
        std::fs::create_dir_all(&remotes_dir).expect("failed to create remotes dir");
        Self {
            remotes_dir,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn bare_path(&self, name: &str) -> PathBuf {
        self.remotes_dir.join(format!("{}.git", name))
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// Resolve the tip commit of a bare repository's main branch
    pub fn tip(&self, name: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "refs/heads/main"])
            .env("GIT_DIR", self.bare_path(name))
            .output()
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }
}

#[async_trait]
impl RemoteHost for LocalBareHost {
    async fn exists(&self, name: &str, _binding: &AccountBinding) -> Result<bool, ProvisionError> {
        Ok(self.bare_path(name).exists())
    }

    async fn create(
        &self,
        name: &str,
        _description: &str,
        binding: &AccountBinding,
    ) -> Result<RemoteDescriptor, ProvisionError> {
        let path = self.bare_path(name);
        if path.exists() {
            return Err(ProvisionError::NameConflict(name.to_string()));
        }

        let output = Command::new("git")
            .args(["init", "--bare", "-b", "main"])
            .arg(&path)
            .output()
            .map_err(|e| ProvisionError::Network(e.to_string()))?;
        if !output.status.success() {
            return Err(ProvisionError::Network(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        self.created.lock().unwrap().push(name.to_string());

        Ok(RemoteDescriptor {
            name: name.to_string(),
            owner: binding.remote_owner().to_string(),
            remote_url: path.display().to_string(),
        })
    }

    async fn verify_auth(&self, _binding: &AccountBinding) -> Result<(), ProvisionError> {
        Ok(())
    }
}

/// Binding rooted at `root` for `account`, with defaults everywhere else
pub fn binding(root: &Path, account: &str) -> AccountBinding {
    AccountBinding {
        root_path: root.display().to_string(),
        account_id: account.to_string(),
        credential_ref: None,
        remote_host_alias: format!("github.com-{}", account),
        commit_name: None,
        commit_email: None,
        visibility: Default::default(),
        organization: None,
        conflict_policy: Default::default(),
        provisioner: Default::default(),
    }
}

/// Config with the given bindings and state kept under `state_dir`
pub fn config(bindings: Vec<AccountBinding>, state_dir: &Path) -> Config {
    let mut config = Config::default();
    config.accounts = bindings;
    config.daemon.state_file = state_dir.join("state.json").display().to_string();
    config.daemon.pid_file = state_dir.join("daemon.pid").display().to_string();
    config.daemon.log_file = String::new();
    config
}

/// Create a folder that passes project classification: a manifest plus
/// enough source bytes to clear the size threshold
pub fn make_project(root: &Path, name: &str) -> PathBuf {
    let project = root.join(name);
    std::fs::create_dir_all(project.join("src")).unwrap();
    std::fs::write(
        project.join("Cargo.toml"),
        format!("[package]\nname = \"{}\"\nversion = \"0.1.0\"\n", name),
    )
    .unwrap();
    std::fs::write(
        project.join("src/main.rs"),
        format!("fn main() {{\n    // {}\n}}\n{}", name, "// filler\n".repeat(200)),
    )
    .unwrap();
    project
}
