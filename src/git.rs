use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::{AccountBinding, ConflictPolicy, DetectionConfig, GitConfig};

/// Capability interface over local repository operations, as the
/// orchestrator consumes them. `GitDriver` is the real implementation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepoDriver: Send + Sync {
    fn is_repository(&self, path: &Path) -> bool;
    async fn initialize(&self, path: &Path, binding: &AccountBinding) -> Result<()>;
    async fn has_remote(&self, path: &Path) -> Result<bool>;
    async fn add_remote(&self, path: &Path, address: &str) -> Result<()>;
    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool>;
    async fn sync(&self, path: &Path, binding: &AccountBinding) -> Result<SyncOutcome>;
}

/// Why a sync attempt did not end in a confirmed push
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("repository has no remote configured")]
    NoRemote,
    #[error("local and remote history diverged")]
    Diverged,
    #[error("push rejected by remote: {0}")]
    PushRejected(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("git operation failed: {0}")]
    Other(String),
}

/// Outcome of one sync pass over a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to commit and nothing outstanding to push
    NoChanges,
    /// Changes were committed (or were already pending) and the push was
    /// confirmed by per-ref inspection
    Pushed,
    /// Sync did not complete; the repository is unchanged or locally
    /// committed but not on the remote
    Failed(SyncError),
}

/// Local git operations, all scoped to one repository path per call.
///
/// Commit identity is always set repo-local, never global, because one
/// machine hosts repositories under several identities at once.
pub struct GitDriver {
    git: GitConfig,
    detection: DetectionConfig,
}

impl GitDriver {
    pub fn new(git: GitConfig, detection: DetectionConfig) -> Self {
        Self { git, detection }
    }

    /// Check whether the path already holds a git repository
    pub fn is_repository(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    /// Initialize a repository with the configured default branch, a
    /// generated ignore file, the binding's identity, and an initial commit.
    ///
    /// Idempotent: an already-initialized repository only gets its identity
    /// refreshed.
    pub async fn initialize(&self, path: &Path, binding: &AccountBinding) -> Result<()> {
        if self.is_repository(path) {
            debug!("Repository already initialized: {}", path.display());
            self.set_identity(path, binding).await?;
            return Ok(());
        }

        info!("Initializing repository: {}", path.display());

        let output = AsyncCommand::new("git")
            .args(["init", "-b", &self.git.default_branch])
            .current_dir(path)
            .output()
            .await
            .context("Failed to execute git init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Git init failed: {}", stderr));
        }

        self.set_identity(path, binding).await?;
        self.write_gitignore(path).await?;

        self.run_git(path, &["add", "-A"])
            .await
            .context("Failed to stage initial files")?;

        // A fresh folder may hold nothing stageable yet
        if self.has_staged_changes(path).await? {
            self.run_git(path, &["commit", "-m", "Initial commit"])
                .await
                .context("Failed to create initial commit")?;
        }

        Ok(())
    }

    /// Set repo-local author name and email from the binding
    pub async fn set_identity(&self, path: &Path, binding: &AccountBinding) -> Result<()> {
        let (name, email) = binding.commit_identity();

        self.run_git(path, &["config", "user.name", &name])
            .await
            .context("Failed to set user.name")?;
        self.run_git(path, &["config", "user.email", &email])
            .await
            .context("Failed to set user.email")?;

        debug!(
            "Set commit identity for {}: {} <{}>",
            path.display(),
            name,
            email
        );
        Ok(())
    }

    /// Check whether the repository has an `origin` remote
    pub async fn has_remote(&self, path: &Path) -> Result<bool> {
        let output = AsyncCommand::new("git")
            .args(["remote", "get-url", "origin"])
            .current_dir(path)
            .output()
            .await
            .context("Failed to query remote URL")?;

        Ok(output.status.success())
    }

    /// Current `origin` URL, if any
    pub async fn remote_url(&self, path: &Path) -> Result<Option<String>> {
        let output = AsyncCommand::new("git")
            .args(["remote", "get-url", "origin"])
            .current_dir(path)
            .output()
            .await
            .context("Failed to query remote URL")?;

        if output.status.success() {
            let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(Some(url))
        } else {
            Ok(None)
        }
    }

    /// Point `origin` at the given address, replacing any existing URL
    pub async fn add_remote(&self, path: &Path, address: &str) -> Result<()> {
        if self.has_remote(path).await? {
            self.run_git(path, &["remote", "set-url", "origin", address])
                .await
                .context("Failed to update remote URL")?;
        } else {
            self.run_git(path, &["remote", "add", "origin", address])
                .await
                .context("Failed to add remote")?;
        }

        debug!("Remote for {} set to {}", path.display(), address);
        Ok(())
    }

    /// Any modified, staged, or untracked files?
    pub async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool> {
        let output = AsyncCommand::new("git")
            .args(["status", "--porcelain"])
            .current_dir(path)
            .output()
            .await
            .context("Failed to check git status")?;

        Ok(!output.stdout.is_empty())
    }

    /// Stage everything, commit outstanding changes with the templated
    /// message, then pull (optionally) and push.
    ///
    /// Push success is decided by per-ref inspection of `git push
    /// --porcelain` output, never by the absence of an error: a remote can
    /// reject a ref update while the transport exits cleanly.
    pub async fn sync(&self, path: &Path, binding: &AccountBinding) -> Result<SyncOutcome> {
        if !self.has_remote(path).await? {
            return Ok(SyncOutcome::Failed(SyncError::NoRemote));
        }

        if self.has_uncommitted_changes(path).await? {
            self.run_git(path, &["add", "-A"])
                .await
                .context("Failed to stage changes")?;

            let message = self.commit_message();
            let output = AsyncCommand::new("git")
                .args(["commit", "-m", &message])
                .current_dir(path)
                .output()
                .await
                .context("Failed to execute git commit")?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Ok(SyncOutcome::Failed(SyncError::Other(format!(
                    "commit failed: {}",
                    stderr
                ))));
            }

            info!("Committed changes in {}", path.display());
        } else if self.commits_ahead(path).await? == 0 {
            debug!("No changes in {}", path.display());
            return Ok(SyncOutcome::NoChanges);
        }

        let mut force = false;

        if self.git.pull_before_push {
            match self.pull_rebase(path).await? {
                PullOutcome::Ok => {}
                PullOutcome::Diverged => match binding.conflict_policy {
                    ConflictPolicy::Skip => {
                        return Ok(SyncOutcome::Failed(SyncError::Diverged));
                    }
                    ConflictPolicy::Notify => {
                        warn!(
                            target: "repovault::notify",
                            account = %binding.account_id,
                            path = %path.display(),
                            "Repository diverged from remote, manual intervention needed"
                        );
                        return Ok(SyncOutcome::Failed(SyncError::Diverged));
                    }
                    ConflictPolicy::Force => {
                        warn!(
                            "Repository {} diverged, force-pushing per policy",
                            path.display()
                        );
                        force = true;
                    }
                },
                PullOutcome::Network(msg) => {
                    return Ok(SyncOutcome::Failed(SyncError::Network(msg)));
                }
            }
        }

        self.push(path, force).await
    }

    /// Push the default branch and classify the result per ref
    async fn push(&self, path: &Path, force: bool) -> Result<SyncOutcome> {
        let branch = self.git.default_branch.as_str();
        let mut args = vec!["push", "--porcelain"];
        if force {
            args.push("--force");
        }
        args.extend(["origin", branch]);

        let output = AsyncCommand::new("git")
            .args(&args)
            .current_dir(path)
            .output()
            .await
            .context("Failed to execute git push")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(reason) = rejected_ref(&stdout) {
            warn!("Push rejected for {}: {}", path.display(), reason);
            return Ok(SyncOutcome::Failed(SyncError::PushRejected(reason)));
        }

        if !output.status.success() {
            let msg = stderr.trim().to_string();
            // Rejections can surface on stderr when no porcelain line is
            // produced at all
            if msg.contains("[rejected]") || msg.contains("[remote rejected]") {
                return Ok(SyncOutcome::Failed(SyncError::PushRejected(msg)));
            }
            return Ok(SyncOutcome::Failed(SyncError::Network(msg)));
        }

        if !pushed_ref_confirmed(&stdout) {
            // Transport succeeded but no ref update was confirmed
            return Ok(SyncOutcome::Failed(SyncError::PushRejected(
                "push reported no updated refs".to_string(),
            )));
        }

        info!("Pushed {} to origin/{}", path.display(), branch);
        Ok(SyncOutcome::Pushed)
    }

    async fn pull_rebase(&self, path: &Path) -> Result<PullOutcome> {
        let output = AsyncCommand::new("git")
            .args(["pull", "--rebase", "origin", &self.git.default_branch])
            .current_dir(path)
            .output()
            .await
            .context("Failed to execute git pull")?;

        if output.status.success() {
            return Ok(PullOutcome::Ok);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();

        // Leave the worktree clean before reporting divergence
        if stderr.contains("conflict") || stderr.contains("rebase") || stderr.contains("diverg") {
            let _ = self.run_git(path, &["rebase", "--abort"]).await;
            return Ok(PullOutcome::Diverged);
        }

        // A missing remote branch is fine on the very first push
        if stderr.contains("couldn't find remote ref") {
            return Ok(PullOutcome::Ok);
        }

        Ok(PullOutcome::Network(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    /// Commits on the local branch not yet on origin. Zero when the
    /// upstream is unknown (nothing has been pushed yet counts as ahead).
    async fn commits_ahead(&self, path: &Path) -> Result<u32> {
        let range = format!("origin/{}..HEAD", self.git.default_branch);
        let output = AsyncCommand::new("git")
            .args(["rev-list", "--count", &range])
            .current_dir(path)
            .output()
            .await
            .context("Failed to count unpushed commits")?;

        if output.status.success() {
            let count = String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse()
                .unwrap_or(0);
            Ok(count)
        } else {
            // No remote-tracking ref yet: everything local is unpushed
            Ok(1)
        }
    }

    async fn has_staged_changes(&self, path: &Path) -> Result<bool> {
        let output = AsyncCommand::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(path)
            .output()
            .await
            .context("Failed to check staged changes")?;

        // diff --quiet exits 1 when differences exist
        Ok(!output.status.success())
    }

    async fn write_gitignore(&self, path: &Path) -> Result<()> {
        let gitignore = path.join(".gitignore");
        if gitignore.exists() {
            return Ok(());
        }

        let mut content = String::from("# Generated by repovault\n");
        for pattern in &self.detection.ignore_patterns {
            content.push_str(pattern);
            content.push('\n');
        }

        tokio::fs::write(&gitignore, content)
            .await
            .context("Failed to write .gitignore")?;
        Ok(())
    }

    fn commit_message(&self) -> String {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.git.commit_message.replace("{timestamp}", &timestamp)
    }

    async fn run_git(&self, path: &Path, args: &[&str]) -> Result<()> {
        let output = AsyncCommand::new("git")
            .args(args)
            .current_dir(path)
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr));
        }

        Ok(())
    }
}

#[async_trait]
impl RepoDriver for GitDriver {
    fn is_repository(&self, path: &Path) -> bool {
        GitDriver::is_repository(self, path)
    }

    async fn initialize(&self, path: &Path, binding: &AccountBinding) -> Result<()> {
        GitDriver::initialize(self, path, binding).await
    }

    async fn has_remote(&self, path: &Path) -> Result<bool> {
        GitDriver::has_remote(self, path).await
    }

    async fn add_remote(&self, path: &Path, address: &str) -> Result<()> {
        GitDriver::add_remote(self, path, address).await
    }

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool> {
        GitDriver::has_uncommitted_changes(self, path).await
    }

    async fn sync(&self, path: &Path, binding: &AccountBinding) -> Result<SyncOutcome> {
        GitDriver::sync(self, path, binding).await
    }
}

#[derive(Debug)]
enum PullOutcome {
    Ok,
    Diverged,
    Network(String),
}

/// Scan `git push --porcelain` output for a rejected ref.
///
/// Porcelain lines are `<flag>\t<from>:<to>\t<summary>`; a `!` flag means
/// the remote refused the update even though the command itself may have
/// exited zero.
fn rejected_ref(porcelain: &str) -> Option<String> {
    for line in porcelain.lines() {
        if line.starts_with('!') {
            let summary = line.splitn(3, '\t').nth(2).unwrap_or(line).trim();
            return Some(summary.to_string());
        }
    }
    None
}

/// True when the porcelain output confirms at least one ref was updated
/// (flag ` `, `+` forced, `*` new ref) or was already current (`=`)
fn pushed_ref_confirmed(porcelain: &str) -> bool {
    porcelain
        .lines()
        .any(|line| matches!(line.chars().next(), Some(' ' | '+' | '*' | '=')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProvisionerKind, Visibility};

    fn binding() -> AccountBinding {
        AccountBinding {
            root_path: "/tmp/projects".to_string(),
            account_id: "alice".to_string(),
            credential_ref: None,
            remote_host_alias: "github.com-personal".to_string(),
            commit_name: None,
            commit_email: None,
            visibility: Visibility::Private,
            organization: None,
            conflict_policy: ConflictPolicy::Skip,
            provisioner: ProvisionerKind::Cli,
        }
    }

    fn driver() -> GitDriver {
        GitDriver::new(GitConfig::default(), DetectionConfig::default())
    }

    #[test]
    fn test_commit_message_substitutes_timestamp() {
        let message = driver().commit_message();
        assert!(message.starts_with("Auto-backup: "));
        assert!(!message.contains("{timestamp}"));
    }

    #[test]
    fn test_rejected_ref_detected() {
        let porcelain = "To git@github.com-personal:alice/proj.git\n!\trefs/heads/main:refs/heads/main\t[rejected] (fetch first)\nDone\n";
        let reason = rejected_ref(porcelain).expect("rejection should be detected");
        assert!(reason.contains("rejected"));
    }

    #[test]
    fn test_successful_ref_confirmed() {
        let porcelain = "To git@github.com-personal:alice/proj.git\n \trefs/heads/main:refs/heads/main\tabc1234..def5678\nDone\n";
        assert!(rejected_ref(porcelain).is_none());
        assert!(pushed_ref_confirmed(porcelain));
    }

    #[test]
    fn test_new_ref_confirmed() {
        let porcelain = "To git@github.com-personal:alice/proj.git\n*\trefs/heads/main:refs/heads/main\t[new branch]\nDone\n";
        assert!(pushed_ref_confirmed(porcelain));
    }

    #[test]
    fn test_no_refs_is_not_confirmation() {
        let porcelain = "To git@github.com-personal:alice/proj.git\nDone\n";
        assert!(rejected_ref(porcelain).is_none());
        assert!(!pushed_ref_confirmed(porcelain));
    }

    #[tokio::test]
    async fn test_initialize_creates_repo_with_identity() {
        let temp = tempfile::TempDir::new().unwrap();
        let project = temp.path().join("proj");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(project.join("main.rs"), "fn main() {}\n").unwrap();

        let driver = driver();
        let binding = binding();
        driver.initialize(&project, &binding).await.unwrap();

        assert!(driver.is_repository(&project));
        assert!(project.join(".gitignore").exists());

        let output = std::process::Command::new("git")
            .args(["config", "user.email"])
            .current_dir(&project)
            .output()
            .unwrap();
        let email = String::from_utf8_lossy(&output.stdout).trim().to_string();
        assert_eq!(email, "alice@users.noreply.github.com");

        // Second initialize must not error
        driver.initialize(&project, &binding).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_without_remote_fails_cleanly() {
        let temp = tempfile::TempDir::new().unwrap();
        let project = temp.path().join("proj");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(project.join("lib.py"), "pass\n").unwrap();

        let driver = driver();
        let binding = binding();
        driver.initialize(&project, &binding).await.unwrap();

        let outcome = driver.sync(&project, &binding).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Failed(SyncError::NoRemote));
    }

    #[tokio::test]
    async fn test_add_remote_is_idempotent() {
        let temp = tempfile::TempDir::new().unwrap();
        let project = temp.path().join("proj");
        std::fs::create_dir(&project).unwrap();

        let driver = driver();
        driver.initialize(&project, &binding()).await.unwrap();

        assert!(!driver.has_remote(&project).await.unwrap());
        driver
            .add_remote(&project, "git@github.com-personal:alice/proj.git")
            .await
            .unwrap();
        assert!(driver.has_remote(&project).await.unwrap());

        // Re-pointing replaces rather than failing
        driver
            .add_remote(&project, "git@github.com-personal:alice/proj2.git")
            .await
            .unwrap();
        assert_eq!(
            driver.remote_url(&project).await.unwrap(),
            Some("git@github.com-personal:alice/proj2.git".to_string())
        );
    }

    #[tokio::test]
    async fn test_uncommitted_changes_detection() {
        let temp = tempfile::TempDir::new().unwrap();
        let project = temp.path().join("proj");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(project.join("a.rs"), "fn a() {}\n").unwrap();

        let driver = driver();
        driver.initialize(&project, &binding()).await.unwrap();
        assert!(!driver.has_uncommitted_changes(&project).await.unwrap());

        std::fs::write(project.join("b.rs"), "fn b() {}\n").unwrap();
        assert!(driver.has_uncommitted_changes(&project).await.unwrap());
    }
}
