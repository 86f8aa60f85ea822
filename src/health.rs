//! Preflight checks for repovault
//!
//! Verifies the host is properly set up before the daemon starts:
//! tooling on PATH, watched roots present, credentials resolvable,
//! and the state file location writable.

use crate::config::{Config, ProvisionerKind};
use crate::credentials::CredentialResolver;
use std::path::{Path, PathBuf};

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// gh CLI status (only required when a binding uses the CLI provisioner)
    pub gh_cli: CheckResult,
    /// State file directory writability
    pub state_dir: CheckResult,
    /// SSH configuration status (warning only, not required)
    pub ssh: CheckResult,
    /// Per-binding checks: root exists, credential resolvable
    pub bindings: Vec<(String, CheckResult)>,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config, resolver: &dyn CredentialResolver) -> Self {
        Self {
            git: Self::check_git(),
            gh_cli: Self::check_gh_cli(config),
            state_dir: Self::check_state_dir(config),
            ssh: Self::check_ssh(),
            bindings: Self::check_bindings(config, resolver),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.git.passed
            && self.gh_cli.passed
            && self.state_dir.passed
            && self.bindings.iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.iter_results()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.iter_results().filter(|r| r.is_warning).collect()
    }

    fn iter_results(&self) -> impl Iterator<Item = &CheckResult> {
        [&self.git, &self.gh_cli, &self.state_dir, &self.ssh]
            .into_iter()
            .chain(self.bindings.iter().map(|(_, r)| r))
    }

    /// Check git installation
    fn check_git() -> CheckResult {
        match std::process::Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Check the gh CLI is present when any binding needs it
    fn check_gh_cli(config: &Config) -> CheckResult {
        let needs_cli = config
            .accounts
            .iter()
            .any(|b| b.provisioner == ProvisionerKind::Cli);

        if !needs_cli {
            return CheckResult::ok("gh CLI not required (no CLI provisioner bindings)");
        }

        match std::process::Command::new("gh").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                let first_line = version.lines().next().unwrap_or("").to_string();
                CheckResult::ok_with_details("gh CLI installed", first_line)
            }
            Ok(_) => CheckResult::error("gh command failed"),
            Err(_) => CheckResult::error_with_details(
                "gh CLI not found in PATH",
                "Install gh: https://cli.github.com/ or switch bindings to the api provisioner",
            ),
        }
    }

    /// Check the state file location is usable
    fn check_state_dir(config: &Config) -> CheckResult {
        let state_path = PathBuf::from(&config.daemon.state_file);
        let Some(parent) = state_path.parent() else {
            return CheckResult::error("State file path has no parent directory");
        };

        if parent.exists() {
            return CheckResult::ok_with_details(
                "State directory exists",
                parent.display().to_string(),
            );
        }

        match std::fs::create_dir_all(parent) {
            Ok(_) => CheckResult::ok_with_details(
                "State directory created",
                parent.display().to_string(),
            ),
            Err(e) => CheckResult::error_with_details(
                "Cannot create state directory",
                format!("{}: {}", parent.display(), e),
            ),
        }
    }

    /// Check SSH configuration (warning only)
    fn check_ssh() -> CheckResult {
        let ssh_dir = dirs::home_dir().unwrap_or_default().join(".ssh");
        if !ssh_dir.exists() {
            return CheckResult::warning_with_details(
                "~/.ssh directory not found",
                "Pushes over SSH will not work. Run: ssh-keygen -t ed25519",
            );
        }

        let ssh_keys = ["id_rsa", "id_ed25519", "id_ecdsa"];
        let found_keys: Vec<_> = ssh_keys
            .iter()
            .filter(|key| ssh_dir.join(key).exists())
            .copied()
            .collect();

        if found_keys.is_empty() {
            CheckResult::warning_with_details(
                "No SSH keys found",
                "Pushes over SSH will not work. Run: ssh-keygen -t ed25519",
            )
        } else {
            CheckResult::ok_with_details("SSH keys found", found_keys.join(", "))
        }
    }

    /// Per-binding checks: root present, credential env var resolvable
    fn check_bindings(config: &Config, resolver: &dyn CredentialResolver) -> Vec<(String, CheckResult)> {
        let mut results = Vec::new();

        for binding in &config.accounts {
            let root = binding.root();
            let result = if !root.exists() {
                CheckResult::error_with_details(
                    "Watched root does not exist",
                    format!("Run: mkdir -p {}", root.display()),
                )
            } else if !root.is_dir() {
                CheckResult::error_with_details(
                    "Watched root is not a directory",
                    root.display().to_string(),
                )
            } else {
                Self::check_credential(binding_label(&root), binding, resolver)
            };

            results.push((binding.account_id.clone(), result));
        }

        results
    }

    fn check_credential(
        root_label: String,
        binding: &crate::config::AccountBinding,
        resolver: &dyn CredentialResolver,
    ) -> CheckResult {
        match &binding.credential_ref {
            None => {
                if binding.provisioner == ProvisionerKind::Api {
                    CheckResult::error_with_details(
                        "API provisioner requires a credential_ref",
                        format!("Set credential_ref for {}", binding.account_id),
                    )
                } else {
                    CheckResult::ok_with_details(
                        "Root present, using ambient gh authentication",
                        root_label,
                    )
                }
            }
            Some(env_name) => {
                // Only presence is checked; the token value is never logged
                if resolver.resolve(env_name).is_some() {
                    CheckResult::ok_with_details(
                        "Root present, credential resolvable",
                        format!("{} ({})", root_label, env_name),
                    )
                } else {
                    CheckResult::error_with_details(
                        "Credential environment variable not set",
                        format!("Export {} before starting the daemon", env_name),
                    )
                }
            }
        }
    }

    /// Get all checks as labelled pairs for display
    pub fn all_checks(&self) -> Vec<(String, &CheckResult)> {
        let mut checks: Vec<(String, &CheckResult)> = vec![
            ("Git Installation".to_string(), &self.git),
            ("gh CLI".to_string(), &self.gh_cli),
            ("State Directory".to_string(), &self.state_dir),
            ("SSH Configuration".to_string(), &self.ssh),
        ];
        for (account, result) in &self.bindings {
            checks.push((format!("Account '{}'", account), result));
        }
        checks
    }
}

fn binding_label(root: &Path) -> String {
    root.display().to_string()
}
