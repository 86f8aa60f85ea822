//! Per-root filesystem watching.
//!
//! One watcher runs per account binding, observing only the immediate
//! children of its root. New folders are held back for a settle delay
//! before an event is emitted, so an operator can finish scaffolding a
//! project before it is picked up. The timer resets on every observed
//! mutation: the event fires once the folder has been quiet for the full
//! delay.

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::classify;
use crate::config::{AccountBinding, DetectionConfig};

/// A new candidate folder, already routed to its root's binding.
/// Consumed once by the orchestrator; never persisted.
#[derive(Debug, Clone)]
pub struct FolderEvent {
    pub path: PathBuf,
    pub account_id: String,
    pub observed_at: DateTime<Utc>,
}

/// Tracks settle deadlines for candidate folders. Every observation
/// pushes the deadline out by the full delay.
struct SettleTracker {
    delay: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl SettleTracker {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
        }
    }

    fn observe(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now + self.delay);
    }

    /// Remove and return every folder whose quiet period has elapsed
    fn due(&mut self, now: Instant) -> Vec<PathBuf> {
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Map a raw event path to the immediate child of the root it belongs
/// to. Events deeper in the tree still count as activity on their
/// top-level folder; events on the root itself do not.
fn candidate_child(root: &Path, event_path: &Path) -> Option<PathBuf> {
    let relative = event_path.strip_prefix(root).ok()?;
    let first = relative.components().next()?;
    Some(root.join(first.as_os_str()))
}

/// Watches one binding's root directory in a background thread and emits
/// settled folder events into a channel shared with the orchestrator.
pub struct RootWatcher {
    binding: AccountBinding,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RootWatcher {
    /// Start watching. Events are delivered on `events` after the settle
    /// delay; folders matching an ignore pattern never start a timer.
    pub fn start(
        binding: AccountBinding,
        detection: DetectionConfig,
        settle_delay: Duration,
        events: mpsc::Sender<FolderEvent>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_binding = binding.clone();

        let handle = std::thread::spawn(move || {
            if let Err(e) = watch_loop(
                thread_binding,
                detection,
                settle_delay,
                events,
                thread_shutdown,
            ) {
                error!("Watcher thread failed: {}", e);
            }
        });

        Self {
            binding,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.binding.account_id
    }

    /// Signal the watcher to stop and wait for its thread to exit
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RootWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(
    binding: AccountBinding,
    detection: DetectionConfig,
    settle_delay: Duration,
    events: mpsc::Sender<FolderEvent>,
    shutdown: Arc<AtomicBool>,
) -> notify::Result<()> {
    let root = binding.root();
    let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

    let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())?;
    watcher.watch(&root, RecursiveMode::NonRecursive)?;

    info!(
        account = %binding.account_id,
        "Watching {} (settle delay {:?})",
        root.display(),
        settle_delay
    );

    let mut tracker = SettleTracker::new(settle_delay);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        // Short timeout so shutdown and due timers are both checked
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(event)) => {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
                ) {
                    continue;
                }
                for path in &event.paths {
                    let Some(candidate) = candidate_child(&root, path) else {
                        continue;
                    };
                    if !candidate.is_dir() {
                        continue;
                    }
                    // Filter before the timer starts: ignored folders
                    // never cause a wakeup
                    if classify::is_ignored_name(&candidate, &detection) {
                        debug!("Ignoring folder: {}", candidate.display());
                        continue;
                    }
                    if tracker.pending.contains_key(&candidate) {
                        debug!("Settle timer reset: {}", candidate.display());
                    } else {
                        info!(
                            account = %binding.account_id,
                            "New folder detected: {}, waiting for it to settle",
                            candidate.display()
                        );
                    }
                    tracker.observe(candidate, Instant::now());
                }
            }
            Ok(Err(e)) => {
                warn!("Watch error on {}: {}", root.display(), e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if tracker.is_empty() {
            continue;
        }

        for path in tracker.due(Instant::now()) {
            // The operator may have deleted the folder during the delay
            if !path.is_dir() {
                debug!("Folder vanished before settling: {}", path.display());
                continue;
            }
            let event = FolderEvent {
                path,
                account_id: binding.account_id.clone(),
                observed_at: Utc::now(),
            };
            if events.blocking_send(event).is_err() {
                // Orchestrator is gone, nothing left to do
                return Ok(());
            }
        }
    }

    info!(account = %binding.account_id, "Stopped watching {}", root.display());
    Ok(())
}

/// Candidate folders already present under a root at startup, with
/// ignore filtering applied. Used for the initial scan before watchers
/// take over.
pub fn existing_candidates(root: &Path, detection: &DetectionConfig) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        warn!("Cannot read root directory: {}", root.display());
        return Vec::new();
    };

    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| !classify::is_ignored_name(p, detection))
        .collect();
    candidates.sort();
    candidates
}
