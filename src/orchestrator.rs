//! Backup orchestration.
//!
//! The orchestrator owns the shared tracked-repository map, routes folder
//! events to their binding, drives each repository through provisioning,
//! and runs the periodic reconciliation cycle. The map lock is held only
//! for reads and updates, never across a git or network call; entering the
//! `Provisioning` state is the claim that stops two workers from
//! provisioning the same path concurrently.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::classify;
use crate::config::{AccountBinding, Config};
use crate::credentials::CredentialResolver;
use crate::git::{GitDriver, RepoDriver, SyncError, SyncOutcome};
use crate::github::{self, ProvisionError, RemoteHost};
use crate::state::{LifecycleState, StateStore, TrackedRepository};
use crate::watcher::FolderEvent;

/// Per-repository outcome of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing outstanding
    NoOp,
    /// Changes were committed and the push was confirmed
    Pushed,
    /// Provisioning or sync failed; retried next cycle
    Failed(String),
    /// Disabled by the operator, not visited
    Skipped,
}

/// Summary of one reconciliation cycle
#[derive(Debug, Clone)]
pub struct BackupCycleResult {
    pub outcomes: Vec<(PathBuf, CycleOutcome)>,
    pub duration: Duration,
}

impl BackupCycleResult {
    pub fn pushed(&self) -> usize {
        self.count(|o| matches!(o, CycleOutcome::Pushed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CycleOutcome::Failed(_)))
    }

    pub fn no_op(&self) -> usize {
        self.count(|o| matches!(o, CycleOutcome::NoOp))
    }

    fn count(&self, predicate: impl Fn(&CycleOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| predicate(o)).count()
    }
}

/// Aggregate status for reporting
#[derive(Debug, Clone)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub per_account_counts: HashMap<String, usize>,
    pub total_backups: u64,
    pub total_failures: u64,
}

/// The coordinator owning watchers' downstream state, account routing,
/// and the per-repository lifecycle.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    driver: Arc<dyn RepoDriver>,
    hosts: Arc<HashMap<String, Arc<dyn RemoteHost>>>,
    repos: Arc<Mutex<HashMap<PathBuf, TrackedRepository>>>,
    store: Arc<StateStore>,
    running: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Build an orchestrator over the real git driver and the provisioner
    /// each binding selects.
    pub fn new(config: Config, resolver: Arc<dyn CredentialResolver>) -> Result<Self> {
        let driver: Arc<dyn RepoDriver> = Arc::new(GitDriver::new(
            config.git.clone(),
            config.detection.clone(),
        ));

        let mut hosts: HashMap<String, Arc<dyn RemoteHost>> = HashMap::new();
        for binding in &config.accounts {
            hosts.insert(
                binding.account_id.clone(),
                Arc::from(github::host_for(binding.provisioner, Arc::clone(&resolver))),
            );
        }

        let store = StateStore::new(&config.daemon.state_file);
        Self::with_collaborators(config, driver, hosts, store)
    }

    /// Wire in explicit collaborators. Used by tests and by `new`.
    pub fn with_collaborators(
        config: Config,
        driver: Arc<dyn RepoDriver>,
        hosts: HashMap<String, Arc<dyn RemoteHost>>,
        store: StateStore,
    ) -> Result<Self> {
        let mut repos = store.load().context("Failed to load state")?;

        // Records persisted before account ids were stored are re-bound
        // from whichever root contains them
        for (path, repo) in repos.iter_mut() {
            if repo.account_id.is_empty() {
                if let Some(binding) = config.binding_for_path(path) {
                    repo.account_id = binding.account_id.clone();
                    info!(
                        "Re-bound {} to account {}",
                        path.display(),
                        binding.account_id
                    );
                }
            }
        }

        Ok(Self {
            config: Arc::new(config),
            driver,
            hosts: Arc::new(hosts),
            repos: Arc::new(Mutex::new(repos)),
            store: Arc::new(store),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    /// Verify that every binding can authenticate. A binding that cannot
    /// is reported and excluded from startup, without stopping the rest.
    pub async fn verify_accounts(&self) -> Vec<AccountBinding> {
        let mut healthy = Vec::new();

        for binding in &self.config.accounts {
            let Some(host) = self.hosts.get(&binding.account_id) else {
                error!("No provisioner wired for account {}", binding.account_id);
                continue;
            };

            match host.verify_auth(binding).await {
                Ok(()) => {
                    info!(account = %binding.account_id, "Account authenticated");
                    healthy.push(binding.clone());
                }
                Err(e) => {
                    error!(
                        account = %binding.account_id,
                        "Account failed authentication, its root will not be watched: {}",
                        e
                    );
                }
            }
        }

        healthy
    }

    /// Handle a settled folder event from a watcher: route it to its
    /// binding, classify it, and provision it if accepted.
    pub async fn on_folder_detected(&self, event: FolderEvent) {
        let Some(binding) = self.binding_for_event(&event) else {
            warn!(
                "Dropping event for {}: no binding owns it",
                event.path.display()
            );
            return;
        };

        if !classify::is_project(&event.path, &self.config.detection) {
            debug!("Not a project: {}", event.path.display());
            return;
        }

        {
            let mut repos = self.repos.lock().expect("repos lock poisoned");
            if repos.contains_key(&event.path) {
                debug!("Already tracked: {}", event.path.display());
                return;
            }

            let name = repo_name(&event.path);
            info!(
                account = %binding.account_id,
                "Tracking new project: {} -> {}",
                event.path.display(),
                name
            );
            repos.insert(
                event.path.clone(),
                TrackedRepository::new(name, event.path.clone(), binding.account_id.clone()),
            );
        }
        self.persist();

        if let Err(e) = self.provision(&event.path).await {
            error!("Provisioning {} failed: {}", event.path.display(), e);
        }
    }

    /// Scan the given bindings' roots for projects that already exist,
    /// tracking and provisioning anything new. Run once at startup before
    /// the watchers take over.
    pub async fn initial_scan(&self, bindings: &[AccountBinding]) {
        for binding in bindings {
            let candidates =
                crate::watcher::existing_candidates(&binding.root(), &self.config.detection);
            for path in candidates {
                let event = FolderEvent {
                    path,
                    account_id: binding.account_id.clone(),
                    observed_at: Utc::now(),
                };
                self.on_folder_detected(event).await;
            }
        }
    }

    /// Drive one repository through provisioning: local init, identity,
    /// remote ensure, initial push. Idempotent; re-entry after a partial
    /// failure picks up where it left off.
    pub async fn provision(&self, path: &Path) -> Result<()> {
        // Check-and-claim under the lock; Provisioning is the claim
        let claimed = {
            let mut repos = self.repos.lock().expect("repos lock poisoned");
            let Some(repo) = repos.get_mut(path) else {
                return Ok(());
            };
            if repo.lifecycle == LifecycleState::Provisioning {
                debug!("Provisioning already in flight: {}", path.display());
                return Ok(());
            }
            repo.lifecycle = LifecycleState::Provisioning;

            match self.binding_for_account(&repo.account_id) {
                Some(binding) => Some((binding, repo.remote_url.is_none())),
                None => {
                    repo.record_failure("no binding configured for account");
                    None
                }
            }
        };
        self.persist();
        let Some((binding, description_wanted)) = claimed else {
            return Ok(());
        };

        let result = self.provision_steps(path, &binding, description_wanted).await;

        {
            let mut repos = self.repos.lock().expect("repos lock poisoned");
            if let Some(repo) = repos.get_mut(path) {
                repo.last_check_time = Some(Utc::now());
                match &result {
                    Ok(ProvisionDone { remote_url, pushed }) => {
                        repo.remote_url = Some(remote_url.clone());
                        if *pushed {
                            repo.record_push(Utc::now());
                        } else {
                            repo.lifecycle = LifecycleState::Synced;
                            repo.last_error = None;
                        }
                        info!(
                            account = %binding.account_id,
                            "Provisioned {} -> {}",
                            path.display(),
                            remote_url
                        );
                    }
                    Err(e) => {
                        repo.record_failure(e.to_string());
                        warn!("Provisioning {} failed: {}", path.display(), e);
                    }
                }
            }
        }
        self.persist();

        result.map(|_| ())
    }

    async fn provision_steps(
        &self,
        path: &Path,
        binding: &AccountBinding,
        generate_description: bool,
    ) -> Result<ProvisionDone> {
        let host = self
            .hosts
            .get(&binding.account_id)
            .with_context(|| format!("no provisioner for account {}", binding.account_id))?;

        self.driver
            .initialize(path, binding)
            .await
            .context("local init failed")?;

        let name = repo_name(path);
        let description = if generate_description {
            github::generate_description(path)
        } else {
            String::new()
        };

        let descriptor = github::ensure_remote(host.as_ref(), &name, &description, binding)
            .await
            .map_err(provision_error_context)?;

        self.driver
            .add_remote(path, &descriptor.remote_url)
            .await
            .context("failed to set remote")?;

        match self.driver.sync(path, binding).await? {
            SyncOutcome::Pushed => Ok(ProvisionDone {
                remote_url: descriptor.remote_url,
                pushed: true,
            }),
            SyncOutcome::NoChanges => Ok(ProvisionDone {
                remote_url: descriptor.remote_url,
                pushed: false,
            }),
            SyncOutcome::Failed(e) => Err(anyhow::Error::new(e).context("initial push failed")),
        }
    }

    /// One reconciliation pass over every tracked, enabled repository.
    /// Failures are recorded per repository and never abort the cycle.
    pub async fn run_cycle(&self) -> BackupCycleResult {
        let start = Instant::now();

        let targets: Vec<(PathBuf, bool)> = {
            let repos = self.repos.lock().expect("repos lock poisoned");
            repos
                .values()
                .map(|r| (r.local_path.clone(), r.enabled))
                .collect()
        };

        info!("Starting reconciliation cycle over {} repositories", targets.len());

        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.daemon.max_parallel.max(1),
        ));
        let mut futures = FuturesUnordered::new();

        for (path, enabled) in targets {
            if !enabled {
                debug!("Skipping disabled repository: {}", path.display());
                futures.push(futures::future::Either::Left(futures::future::ready((
                    path,
                    CycleOutcome::Skipped,
                ))));
                continue;
            }

            let orchestrator = self.clone();
            let semaphore = Arc::clone(&semaphore);
            futures.push(futures::future::Either::Right(Box::pin(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let outcome = orchestrator.reconcile_one(&path).await;
                (path, outcome)
            })));
        }

        let mut outcomes = Vec::new();
        while let Some((path, outcome)) = futures.next().await {
            outcomes.push((path, outcome));
        }

        let result = BackupCycleResult {
            outcomes,
            duration: start.elapsed(),
        };

        info!(
            "Cycle completed in {:.2}s: {} pushed, {} unchanged, {} failed",
            result.duration.as_secs_f64(),
            result.pushed(),
            result.no_op(),
            result.failed()
        );

        result
    }

    /// Reconcile one repository: provision it if that never completed,
    /// otherwise sync. Updates counters and persists afterwards.
    async fn reconcile_one(&self, path: &Path) -> CycleOutcome {
        let (binding, provisioned) = {
            let repos = self.repos.lock().expect("repos lock poisoned");
            let Some(repo) = repos.get(path) else {
                return CycleOutcome::NoOp;
            };
            if repo.lifecycle == LifecycleState::Provisioning {
                // A claim is already in flight elsewhere
                return CycleOutcome::NoOp;
            }
            let Some(binding) = self.binding_for_account(&repo.account_id) else {
                return CycleOutcome::Failed("no binding configured for account".to_string());
            };
            (binding, repo.remote_url.is_some())
        };

        if !path.exists() {
            self.update_repo(path, |repo| {
                repo.last_check_time = Some(Utc::now());
                repo.record_failure("local folder missing");
            });
            return CycleOutcome::Failed("local folder missing".to_string());
        }

        if !provisioned || !self.driver.is_repository(path) {
            return match self.provision(path).await {
                Ok(()) => {
                    // Provision records its own outcome; report what stuck
                    let repos = self.repos.lock().expect("repos lock poisoned");
                    match repos.get(path).map(|r| r.lifecycle) {
                        Some(LifecycleState::Synced) => CycleOutcome::Pushed,
                        Some(LifecycleState::Failed) => CycleOutcome::Failed(
                            repos
                                .get(path)
                                .and_then(|r| r.last_error.clone())
                                .unwrap_or_else(|| "provisioning failed".to_string()),
                        ),
                        _ => CycleOutcome::NoOp,
                    }
                }
                Err(e) => CycleOutcome::Failed(e.to_string()),
            };
        }

        let outcome = match self.driver.sync(path, &binding).await {
            Ok(outcome) => outcome,
            Err(e) => SyncOutcome::Failed(SyncError::Other(e.to_string())),
        };

        let now = Utc::now();
        let cycle_outcome = match &outcome {
            SyncOutcome::NoChanges => CycleOutcome::NoOp,
            SyncOutcome::Pushed => CycleOutcome::Pushed,
            SyncOutcome::Failed(e) => CycleOutcome::Failed(e.to_string()),
        };

        let count_diverged = self.config.git.count_diverged_as_error;
        self.update_repo(path, move |repo| {
            repo.last_check_time = Some(now);
            match outcome {
                SyncOutcome::NoChanges => {
                    repo.lifecycle = LifecycleState::Synced;
                }
                SyncOutcome::Pushed => {
                    repo.record_push(now);
                }
                SyncOutcome::Failed(SyncError::Diverged) if !count_diverged => {
                    // Policy choice: divergence is a condition, not an
                    // error, so the counter stays put
                    repo.lifecycle = LifecycleState::Failed;
                    repo.last_error = Some(SyncError::Diverged.to_string());
                }
                SyncOutcome::Failed(e) => {
                    repo.record_failure(e.to_string());
                }
            }
        });

        cycle_outcome
    }

    /// Sync one repository by name, or all, outside the periodic schedule
    pub async fn trigger_sync(&self, repo_name: Option<&str>) -> BackupCycleResult {
        match repo_name {
            None => self.run_cycle().await,
            Some(name) => {
                let start = Instant::now();
                let target = {
                    let repos = self.repos.lock().expect("repos lock poisoned");
                    repos
                        .values()
                        .find(|r| r.repo_name == name)
                        .map(|r| (r.local_path.clone(), r.enabled))
                };

                let outcomes = match target {
                    None => Vec::new(),
                    Some((path, false)) => vec![(path, CycleOutcome::Skipped)],
                    Some((path, true)) => {
                        let outcome = self.reconcile_one(&path).await;
                        vec![(path, outcome)]
                    }
                };

                BackupCycleResult {
                    outcomes,
                    duration: start.elapsed(),
                }
            }
        }
    }

    /// Enable or disable a repository by name. Disabled repositories stay
    /// tracked but are skipped by the cycle.
    pub fn set_enabled(&self, repo_name: &str, enabled: bool) -> bool {
        let changed = {
            let mut repos = self.repos.lock().expect("repos lock poisoned");
            let mut changed = false;
            for repo in repos.values_mut() {
                if repo.repo_name == repo_name {
                    repo.enabled = enabled;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            info!(
                "Repository {} {}",
                repo_name,
                if enabled { "enabled" } else { "disabled" }
            );
            self.persist();
        }
        changed
    }

    /// Stop tracking a repository. Local and remote artifacts are left
    /// alone; removing those is a separate operator action.
    pub fn remove(&self, repo_name: &str) -> bool {
        let removed = {
            let mut repos = self.repos.lock().expect("repos lock poisoned");
            let paths: Vec<PathBuf> = repos
                .values()
                .filter(|r| r.repo_name == repo_name)
                .map(|r| r.local_path.clone())
                .collect();
            for path in &paths {
                repos.remove(path);
            }
            !paths.is_empty()
        };
        if removed {
            info!("Stopped tracking {}", repo_name);
            self.persist();
        }
        removed
    }

    /// Snapshot of tracked repositories, optionally filtered by account
    pub fn list_tracked(&self, account_id: Option<&str>) -> Vec<TrackedRepository> {
        let repos = self.repos.lock().expect("repos lock poisoned");
        let mut tracked: Vec<TrackedRepository> = repos
            .values()
            .filter(|r| account_id.map_or(true, |a| r.account_id == a))
            .cloned()
            .collect();
        tracked.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        tracked
    }

    pub fn status(&self) -> OrchestratorStatus {
        let repos = self.repos.lock().expect("repos lock poisoned");
        let mut per_account_counts: HashMap<String, usize> = HashMap::new();
        let mut total_backups = 0;
        let mut total_failures = 0;

        for repo in repos.values() {
            *per_account_counts.entry(repo.account_id.clone()).or_default() += 1;
            total_backups += repo.backup_count;
            total_failures += repo.error_count;
        }

        OrchestratorStatus {
            running: self.running.load(Ordering::Relaxed),
            per_account_counts,
            total_backups,
            total_failures,
        }
    }

    fn binding_for_event(&self, event: &FolderEvent) -> Option<AccountBinding> {
        let binding = self.config.binding_for_path(&event.path)?;
        // The event's routing must agree with the configured root owner
        if binding.account_id != event.account_id {
            error!(
                "Event for {} routed as {} but root belongs to {}",
                event.path.display(),
                event.account_id,
                binding.account_id
            );
            return None;
        }
        Some(binding.clone())
    }

    fn binding_for_account(&self, account_id: &str) -> Option<AccountBinding> {
        self.config
            .accounts
            .iter()
            .find(|b| b.account_id == account_id)
            .cloned()
    }

    fn update_repo(&self, path: &Path, mutate: impl FnOnce(&mut TrackedRepository)) {
        {
            let mut repos = self.repos.lock().expect("repos lock poisoned");
            if let Some(repo) = repos.get_mut(path) {
                mutate(repo);
            }
        }
        self.persist();
    }

    /// Write the map through to disk. A failed save only logs: the
    /// previous document is still intact and the next mutation retries.
    fn persist(&self) {
        let snapshot = {
            let repos = self.repos.lock().expect("repos lock poisoned");
            repos.clone()
        };
        if let Err(e) = self.store.save(&snapshot) {
            warn!("State save failed, keeping previous document: {}", e);
        }
    }
}

struct ProvisionDone {
    remote_url: String,
    pushed: bool,
}

fn provision_error_context(e: ProvisionError) -> anyhow::Error {
    anyhow::Error::new(e).context("remote provisioning failed")
}

/// Repository name derived from the folder name
fn repo_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}
