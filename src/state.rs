//! Durable per-repository state.
//!
//! A single JSON document maps each local path to its tracked-repository
//! record. Every mutation is written through atomically (temp file plus
//! rename) so a crash mid-write can never corrupt the last good document.
//! Stored in XDG_DATA_HOME/repovault/state.json by default.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// State persistence failures. A failed save loses nothing: the previous
/// document stays intact and the next successful cycle retries.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("failed to write state document: {0}")]
    WriteFailed(String),
}

/// Where a tracked repository is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Accepted as a project, nothing provisioned yet
    #[default]
    Discovered,
    /// Mid-provisioning. Holding this state is the concurrency claim on
    /// the repository; it is never a valid state to load from disk.
    Provisioning,
    /// Provisioned and reconciled
    Synced,
    /// Last provisioning or sync attempt failed; retried every cycle
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Discovered => "discovered",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Synced => "synced",
            LifecycleState::Failed => "failed",
        }
    }
}

/// One tracked repository, keyed by its absolute local path.
///
/// `account_id` is copied from the owning binding when the record is
/// created and never re-derived afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRepository {
    pub repo_name: String,
    pub local_path: PathBuf,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub lifecycle: LifecycleState,
    /// Last confirmed successful push
    #[serde(default)]
    pub last_backup_time: Option<DateTime<Utc>>,
    /// Last reconciliation attempt, success or not
    #[serde(default)]
    pub last_check_time: Option<DateTime<Utc>>,
    /// Increments only on a confirmed push
    #[serde(default)]
    pub backup_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TrackedRepository {
    pub fn new(repo_name: String, local_path: PathBuf, account_id: String) -> Self {
        Self {
            repo_name,
            local_path,
            account_id,
            remote_url: None,
            lifecycle: LifecycleState::Discovered,
            last_backup_time: None,
            last_check_time: None,
            backup_count: 0,
            error_count: 0,
            last_error: None,
            enabled: true,
        }
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.lifecycle = LifecycleState::Failed;
        self.error_count += 1;
        self.last_error = Some(error.into());
    }

    pub fn record_push(&mut self, now: DateTime<Utc>) {
        self.lifecycle = LifecycleState::Synced;
        self.last_backup_time = Some(now);
        self.backup_count += 1;
        self.last_error = None;
    }
}

/// On-disk document layout
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default = "current_version")]
    version: u32,
    #[serde(default)]
    repositories: HashMap<PathBuf, TrackedRepository>,
}

fn current_version() -> u32 {
    1
}

/// Crash-safe store for the tracked-repository map
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the tracked-repository map. A missing file is an empty map;
    /// records missing newer fields are backfilled with defaults rather
    /// than rejected.
    pub fn load(&self) -> Result<HashMap<PathBuf, TrackedRepository>> {
        if !self.path.exists() {
            debug!("No state document at {:?}, starting empty", self.path);
            return Ok(HashMap::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state document: {:?}", self.path))?;

        let document: StateDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state document: {:?}", self.path))?;

        let mut repositories = document.repositories;

        for (path, repo) in repositories.iter_mut() {
            // Records that predate the account field get an empty id; the
            // orchestrator re-binds them from the owning root at startup
            if repo.account_id.is_empty() {
                warn!("State record {:?} has no account id, will re-bind", path);
            }

            // A persisted Provisioning state means the process died
            // mid-provision; the claim does not survive restart
            if repo.lifecycle == LifecycleState::Provisioning {
                repo.lifecycle = LifecycleState::Discovered;
            }
        }

        info!(
            "Loaded {} tracked repositories from {:?}",
            repositories.len(),
            self.path
        );
        Ok(repositories)
    }

    /// Persist the full map atomically: serialize to a sibling temp file,
    /// then rename over the document. Never truncates in place.
    pub fn save(
        &self,
        repositories: &HashMap<PathBuf, TrackedRepository>,
    ) -> Result<(), StateStoreError> {
        let document = StateDocument {
            version: current_version(),
            repositories: repositories.clone(),
        };

        let content = serde_json::to_string_pretty(&document)
            .map_err(|e| StateStoreError::WriteFailed(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StateStoreError::WriteFailed(e.to_string()))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)
            .map_err(|e| StateStoreError::WriteFailed(e.to_string()))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| StateStoreError::WriteFailed(e.to_string()))?;

        debug!(
            "Saved {} tracked repositories to {:?}",
            repositories.len(),
            self.path
        );
        Ok(())
    }
}
