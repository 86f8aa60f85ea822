//! repovault - Multi-Account Git Backup Daemon
//!
//! repovault watches a set of local folders, classifies new subfolders as
//! projects, and keeps each one backed up to the hosting account bound to
//! its root. It provisions local and remote repositories idempotently and
//! reconciles commit/pull/push state on a periodic cycle.
//!
//! ## Core Features
//!
//! - **Account Routing**: each watched root is bound to exactly one hosting
//!   identity; a project never crosses to another account
//! - **Project Detection**: manifest files, source extensions, and size
//!   thresholds decide what counts as a project
//! - **Idempotent Provisioning**: local init, remote creation, and remote
//!   wiring all converge on the same end state when re-run
//! - **Crash-Safe State**: per-repository lifecycle persisted atomically
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration with per-root account bindings
//! - [`classify`]: project detection rules
//! - [`watcher`]: filesystem watching with settle-delay debounce
//! - [`orchestrator`]: provisioning and reconciliation engine
//! - [`daemon`]: long-running service wrapper

pub mod classify;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod git;
pub mod github;
pub mod health;
pub mod orchestrator;
pub mod state;
pub mod watcher;

pub use config::{AccountBinding, Config};
pub use credentials::{CredentialResolver, EnvCredentials};
pub use daemon::Daemon;
pub use git::{GitDriver, RepoDriver, SyncOutcome};
pub use github::{ProvisionError, RemoteHost};
pub use orchestrator::{BackupCycleResult, CycleOutcome, Orchestrator};
pub use state::{LifecycleState, StateStore, TrackedRepository};
