//! End-to-end tests over the orchestrator with the real git binary.
//!
//! Hosting accounts are simulated by bare repositories on disk (see
//! `common::LocalBareHost`), so provisioning, pushing, and reconciliation
//! all run the real plumbing.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{binding, config, make_project, LocalBareHost};
use repovault::git::GitDriver;
use repovault::orchestrator::{CycleOutcome, Orchestrator};
use repovault::state::{LifecycleState, StateStore};
use repovault::{RemoteHost, RepoDriver};
use tempfile::TempDir;

struct Harness {
    _temp: TempDir,
    orchestrator: Orchestrator,
    hosts: Vec<Arc<LocalBareHost>>,
    roots: Vec<std::path::PathBuf>,
}

/// One orchestrator over `accounts` bindings, each with its own root
/// directory and its own bare-repository host
fn harness(accounts: &[&str]) -> Harness {
    let temp = TempDir::new().unwrap();

    let mut bindings = Vec::new();
    let mut hosts = Vec::new();
    let mut host_map: HashMap<String, Arc<dyn RemoteHost>> = HashMap::new();
    let mut roots = Vec::new();

    for account in accounts {
        let root = temp.path().join(format!("root-{}", account));
        std::fs::create_dir_all(&root).unwrap();

        let host = Arc::new(LocalBareHost::new(
            temp.path().join(format!("remotes-{}", account)),
        ));
        host_map.insert(account.to_string(), host.clone() as Arc<dyn RemoteHost>);

        bindings.push(binding(&root, account));
        hosts.push(host);
        roots.push(root);
    }

    let config = config(bindings, temp.path());
    let driver: Arc<dyn RepoDriver> = Arc::new(GitDriver::new(
        config.git.clone(),
        config.detection.clone(),
    ));
    let store = StateStore::new(&config.daemon.state_file);

    let orchestrator = Orchestrator::with_collaborators(config, driver, host_map, store).unwrap();
    orchestrator.set_running(true);

    Harness {
        _temp: temp,
        orchestrator,
        hosts,
        roots,
    }
}

#[tokio::test]
async fn provisioning_pushes_initial_commit_to_remote() {
    let h = harness(&["alice"]);
    let project = make_project(&h.roots[0], "notes-app");

    let healthy = h.orchestrator.verify_accounts().await;
    assert_eq!(healthy.len(), 1);
    h.orchestrator.initial_scan(&healthy).await;

    let tracked = h.orchestrator.list_tracked(None);
    assert_eq!(tracked.len(), 1);
    let repo = &tracked[0];
    assert_eq!(repo.repo_name, "notes-app");
    assert_eq!(repo.account_id, "alice");
    assert_eq!(repo.lifecycle, LifecycleState::Synced);
    assert_eq!(repo.backup_count, 1);
    assert!(repo.last_backup_time.is_some());

    // The bare remote really received the initial commit
    assert_eq!(h.hosts[0].created_names(), vec!["notes-app".to_string()]);
    assert!(h.hosts[0].tip("notes-app").is_some());

    // The local folder became a repository with the binding's identity
    assert!(project.join(".git").exists());
    let output = std::process::Command::new("git")
        .args(["config", "user.email"])
        .current_dir(&project)
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "alice@users.noreply.github.com"
    );
}

#[tokio::test]
async fn accounts_stay_isolated_end_to_end() {
    let h = harness(&["alice", "bob"]);
    make_project(&h.roots[0], "alice-project");
    make_project(&h.roots[1], "bob-project");

    let healthy = h.orchestrator.verify_accounts().await;
    h.orchestrator.initial_scan(&healthy).await;

    let alice_repos = h.orchestrator.list_tracked(Some("alice"));
    let bob_repos = h.orchestrator.list_tracked(Some("bob"));
    assert_eq!(alice_repos.len(), 1);
    assert_eq!(bob_repos.len(), 1);
    assert_eq!(alice_repos[0].repo_name, "alice-project");
    assert_eq!(bob_repos[0].repo_name, "bob-project");

    // Each project was created on its own account's host, never the other
    assert_eq!(h.hosts[0].created_names(), vec!["alice-project".to_string()]);
    assert_eq!(h.hosts[1].created_names(), vec!["bob-project".to_string()]);
    assert!(h.hosts[0].tip("bob-project").is_none());
    assert!(h.hosts[1].tip("alice-project").is_none());
}

#[tokio::test]
async fn cycle_pushes_new_work_and_noops_when_clean() {
    let h = harness(&["alice"]);
    let project = make_project(&h.roots[0], "journal");

    let healthy = h.orchestrator.verify_accounts().await;
    h.orchestrator.initial_scan(&healthy).await;
    let tip_after_provision = h.hosts[0].tip("journal").unwrap();

    // Nothing changed since provisioning
    let result = h.orchestrator.run_cycle().await;
    assert_eq!(result.no_op(), 1);
    assert_eq!(result.pushed(), 0);
    assert_eq!(h.hosts[0].tip("journal").unwrap(), tip_after_provision);

    // New work appears
    std::fs::write(project.join("entry.md"), "# Today\n").unwrap();
    let result = h.orchestrator.run_cycle().await;
    assert_eq!(result.pushed(), 1);
    assert_eq!(result.failed(), 0);
    assert_ne!(h.hosts[0].tip("journal").unwrap(), tip_after_provision);

    let repo = &h.orchestrator.list_tracked(None)[0];
    assert_eq!(repo.backup_count, 2);
    assert_eq!(repo.lifecycle, LifecycleState::Synced);
    assert!(repo.last_error.is_none());
}

#[tokio::test]
async fn state_survives_restart_without_reprovisioning() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root-alice");
    std::fs::create_dir_all(&root).unwrap();
    make_project(&root, "keeper");

    let host = Arc::new(LocalBareHost::new(temp.path().join("remotes-alice")));
    let cfg = config(vec![binding(&root, "alice")], temp.path());
    let driver: Arc<dyn RepoDriver> =
        Arc::new(GitDriver::new(cfg.git.clone(), cfg.detection.clone()));

    let build = |cfg: &repovault::Config| {
        let mut hosts: HashMap<String, Arc<dyn RemoteHost>> = HashMap::new();
        hosts.insert("alice".to_string(), host.clone() as Arc<dyn RemoteHost>);
        Orchestrator::with_collaborators(
            cfg.clone(),
            driver.clone(),
            hosts,
            StateStore::new(&cfg.daemon.state_file),
        )
        .unwrap()
    };

    let first = build(&cfg);
    let healthy = first.verify_accounts().await;
    first.initial_scan(&healthy).await;
    assert_eq!(first.list_tracked(None).len(), 1);
    drop(first);

    // A new orchestrator over the same state file already knows the repo
    let second = build(&cfg);
    let tracked = second.list_tracked(None);
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].repo_name, "keeper");
    assert_eq!(tracked[0].backup_count, 1);
    assert!(tracked[0].remote_url.is_some());

    // Re-scanning does not create the remote a second time
    let healthy = second.verify_accounts().await;
    second.initial_scan(&healthy).await;
    assert_eq!(host.created_names().len(), 1);
}

#[tokio::test]
async fn disabled_repository_is_skipped_but_kept() {
    let h = harness(&["alice"]);
    let project = make_project(&h.roots[0], "paused");

    let healthy = h.orchestrator.verify_accounts().await;
    h.orchestrator.initial_scan(&healthy).await;
    let tip = h.hosts[0].tip("paused").unwrap();

    assert!(h.orchestrator.set_enabled("paused", false));
    std::fs::write(project.join("later.md"), "not yet\n").unwrap();

    let result = h.orchestrator.run_cycle().await;
    assert!(result
        .outcomes
        .iter()
        .any(|(_, o)| matches!(o, CycleOutcome::Skipped)));
    assert_eq!(result.pushed(), 0);
    assert_eq!(h.hosts[0].tip("paused").unwrap(), tip);

    // Still listed, and re-enabling picks the work back up
    assert_eq!(h.orchestrator.list_tracked(None).len(), 1);
    assert!(h.orchestrator.set_enabled("paused", true));
    let result = h.orchestrator.run_cycle().await;
    assert_eq!(result.pushed(), 1);
}

#[tokio::test]
async fn remove_stops_tracking_but_leaves_everything_in_place() {
    let h = harness(&["alice"]);
    let project = make_project(&h.roots[0], "archive");

    let healthy = h.orchestrator.verify_accounts().await;
    h.orchestrator.initial_scan(&healthy).await;

    assert!(h.orchestrator.remove("archive"));
    assert!(h.orchestrator.list_tracked(None).is_empty());

    // Local folder, its repository, and the remote all survive
    assert!(project.join(".git").exists());
    assert!(h.hosts[0].tip("archive").is_some());

    let result = h.orchestrator.run_cycle().await;
    assert!(result.outcomes.is_empty());
}

