//! Downloaded-content filesystem monitor
//!
//! Keeps the content layer's downloaded flags in line with what is actually
//! in the storage directory. Directory changes are detected by polling the
//! modification times of the root and its first-level subdirectories;
//! bursts are coalesced by a debounce window and then the whole tree is
//! re-enumerated and diffed against the last known set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::content::ContentStore;
use crate::error::Result;
use crate::transfer::PARTIAL_EXTENSION;
use crate::types::Settings;

/// Root files plus one level of subdirectories
pub const MAX_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Added(String),
    Removed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.added
            .iter()
            .cloned()
            .map(MonitorEvent::Added)
            .chain(self.removed.iter().cloned().map(MonitorEvent::Removed))
            .collect()
    }
}

/// Relative paths (forward slashes) of the regular files under `root`, down
/// to `max_depth` levels. Hidden files and partial transfers are skipped.
/// A missing root is an empty tree.
pub fn enumerate(root: &Path, max_depth: usize) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    walk(root, root, 1, max_depth, &mut files);
    files
}

fn walk(root: &Path, dir: &Path, depth: usize, max_depth: usize, files: &mut BTreeSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::debug!("Skipping unreadable directory {:?}: {}", dir, e);
            }
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }

        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();

        if file_type.is_dir() {
            if depth < max_depth {
                walk(root, &path, depth + 1, max_depth, files);
            }
        } else if file_type.is_file() {
            if path.extension().is_some_and(|ext| ext == PARTIAL_EXTENSION) {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                let relative: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                files.insert(relative.join("/"));
            }
        }
    }
}

pub fn diff(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> ChangeSet {
    ChangeSet {
        added: current.difference(previous).cloned().collect(),
        removed: previous.difference(current).cloned().collect(),
    }
}

/// Modification times of the watched directories
fn directory_signature(root: &Path) -> BTreeMap<PathBuf, Option<SystemTime>> {
    let mut signature = BTreeMap::new();
    let mtime = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();

    signature.insert(root.to_path_buf(), mtime(root));
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                let path = entry.path();
                let modified = mtime(&path);
                signature.insert(path, modified);
            }
        }
    }
    signature
}

pub struct FilesystemMonitor {
    root: PathBuf,
    content: Arc<dyn ContentStore>,
    known: BTreeSet<String>,
    poll_interval: Duration,
    debounce: Duration,
}

impl FilesystemMonitor {
    pub fn new(
        root: impl Into<PathBuf>,
        content: Arc<dyn ContentStore>,
        poll_interval: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            content,
            known: BTreeSet::new(),
            poll_interval,
            debounce,
        }
    }

    pub fn from_settings(settings: &Settings, content: Arc<dyn ContentStore>) -> Self {
        Self::new(
            settings.storage_dir(),
            content,
            Duration::from_millis(settings.monitor_poll_interval_ms.max(10)),
            Duration::from_millis(settings.monitor_debounce_ms),
        )
    }

    pub fn known(&self) -> &BTreeSet<String> {
        &self.known
    }

    /// Take the initial enumeration as the known set and correct every
    /// content flag that disagrees with it. No events are produced.
    pub fn prime(&mut self) -> Result<()> {
        self.known = enumerate(&self.root, MAX_DEPTH);
        log::info!("Monitoring {:?} ({} files)", self.root, self.known.len());

        let updates: Vec<(String, bool)> = self
            .content
            .media_paths()?
            .into_iter()
            .map(|(id, paths)| {
                let present = paths.iter().any(|p| self.known.contains(p));
                (id, present)
            })
            .collect();
        self.content.set_downloaded(&updates)
    }

    /// Re-enumerate the tree and apply the differences
    pub fn reconcile(&mut self) -> Result<ChangeSet> {
        let current = enumerate(&self.root, MAX_DEPTH);
        self.apply(current)
    }

    /// Diff `current` against the known set and update the downloaded flag
    /// of every content item touched by the change. `current` becomes the
    /// known set only once the flags are written, so a failed pass is
    /// diffed again next time.
    pub fn apply(&mut self, current: BTreeSet<String>) -> Result<ChangeSet> {
        let changes = diff(&self.known, &current);
        if changes.is_empty() {
            return Ok(changes);
        }
        log::debug!(
            "Storage changed: {} added, {} removed",
            changes.added.len(),
            changes.removed.len()
        );

        let updates: Vec<(String, bool)> = self
            .content
            .media_paths()?
            .into_iter()
            .filter(|(_, paths)| {
                paths
                    .iter()
                    .any(|p| changes.added.contains(p) || changes.removed.contains(p))
            })
            .map(|(id, paths)| {
                let present = paths.iter().any(|p| current.contains(p));
                (id, present)
            })
            .collect();
        self.content.set_downloaded(&updates)?;

        self.known = current;
        Ok(changes)
    }

    /// Prime and run the monitor loop on the current tokio runtime
    pub fn spawn(mut self) -> MonitorHandle {
        let (event_tx, event_rx) = async_channel::bounded(256);
        let (rescan_tx, rescan_rx) = async_channel::bounded(1);

        let task = tokio::spawn(async move {
            if let Err(e) = self.prime() {
                log::warn!("Initial reconcile failed: {}", e);
            }
            self.run(event_tx, rescan_rx).await;
        });

        MonitorHandle {
            events: event_rx,
            rescan_tx,
            task,
        }
    }

    async fn run(
        mut self,
        event_tx: async_channel::Sender<MonitorEvent>,
        rescan_rx: async_channel::Receiver<()>,
    ) {
        let mut signature = directory_signature(&self.root);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline: Option<Instant> = None;

        loop {
            let debounce_elapsed = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = ticker.tick() => {
                    let current = directory_signature(&self.root);
                    if current != signature {
                        signature = current;
                        deadline = Some(Instant::now() + self.debounce);
                    }
                }

                request = rescan_rx.recv() => match request {
                    Ok(()) => deadline = Some(Instant::now() + self.debounce),
                    Err(_) => {
                        log::debug!("Monitor handle dropped, stopping");
                        break;
                    }
                },

                _ = debounce_elapsed => {
                    deadline = None;
                    match self.reconcile() {
                        Ok(changes) => {
                            for event in changes.events() {
                                if event_tx.send(event).await.is_err() {
                                    // Nobody listening; flags are still reconciled
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            log::warn!("Reconcile failed, retrying: {}", e);
                            deadline = Some(Instant::now() + self.poll_interval.max(self.debounce));
                        }
                    }
                }
            }
        }
    }
}

/// Handle to a running monitor; dropping it stops the monitor
pub struct MonitorHandle {
    events: async_channel::Receiver<MonitorEvent>,
    rescan_tx: async_channel::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn events(&self) -> async_channel::Receiver<MonitorEvent> {
        self.events.clone()
    }

    /// Ask for a re-enumeration after the debounce window
    pub fn rescan(&self) {
        // A full channel means a rescan is already pending
        let _ = self.rescan_tx.try_send(());
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentDb;
    use crate::db::Database;
    use crate::error::Error;
    use crate::media::{MediaVariant, SessionMedia};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"media").unwrap();
    }

    fn content_with(sessions: &[(&str, &str)]) -> Arc<ContentDb> {
        let content = ContentDb::new(Database::in_memory().unwrap());
        for (id, path) in sessions {
            content
                .upsert_session(&SessionMedia::new(*id, *id).with_asset(
                    MediaVariant::HdVideo,
                    format!("https://x/{}", path),
                    *path,
                ))
                .unwrap();
        }
        Arc::new(content)
    }

    #[test]
    fn test_enumerate_is_bounded_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "top.mp4");
        touch(root, "2023/a.mp4");
        touch(root, "2023/deeper/too_deep.mp4");
        touch(root, "2023/b.mp4.part");
        touch(root, ".DS_Store");

        let files = enumerate(root, MAX_DEPTH);
        let expected: BTreeSet<String> = ["top.mp4", "2023/a.mp4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(files, expected);
    }

    #[test]
    fn test_enumerate_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(enumerate(&dir.path().join("missing"), MAX_DEPTH).is_empty());
    }

    #[test]
    fn test_adds_and_removes_are_counted_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "keep.mp4");
        touch(root, "2023/gone1.mp4");
        touch(root, "2023/gone2.mp4");

        let mut monitor = FilesystemMonitor::new(
            root,
            content_with(&[]),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        monitor.prime().unwrap();
        assert_eq!(monitor.known().len(), 3);

        // N = 3 added, M = 2 removed
        touch(root, "new1.mp4");
        touch(root, "2024/new2.mp4");
        touch(root, "2024/new3.mp4");
        fs::remove_file(root.join("2023/gone1.mp4")).unwrap();
        fs::remove_file(root.join("2023/gone2.mp4")).unwrap();

        let changes = monitor.reconcile().unwrap();
        let events = changes.events();
        let added = events.iter().filter(|e| matches!(e, MonitorEvent::Added(_))).count();
        let removed = events.iter().filter(|e| matches!(e, MonitorEvent::Removed(_))).count();
        assert_eq!(added, 3);
        assert_eq!(removed, 2);

        let expected: BTreeSet<String> = ["keep.mp4", "new1.mp4", "2024/new2.mp4", "2024/new3.mp4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(monitor.known(), &expected);

        // Nothing changed since the last pass
        assert!(monitor.reconcile().unwrap().is_empty());
    }

    #[test]
    fn test_flags_follow_the_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "2023/a.mp4");
        let content = content_with(&[("a", "2023/a.mp4"), ("b", "2023/b.mp4")]);
        content.set_downloaded(&[("b".to_string(), true)]).unwrap();

        let mut monitor = FilesystemMonitor::new(
            root,
            content.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        // Priming silently corrects both flags
        monitor.prime().unwrap();
        assert!(content.is_downloaded("a").unwrap());
        assert!(!content.is_downloaded("b").unwrap());

        touch(root, "2023/b.mp4");
        fs::remove_file(root.join("2023/a.mp4")).unwrap();
        monitor.reconcile().unwrap();
        assert!(!content.is_downloaded("a").unwrap());
        assert!(content.is_downloaded("b").unwrap());
    }

    /// Content store whose next `media_paths` calls fail
    struct FailingContent {
        inner: Arc<ContentDb>,
        failures: AtomicUsize,
    }

    impl ContentStore for FailingContent {
        fn media_paths(&self) -> Result<BTreeMap<String, Vec<String>>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Database("database is locked".to_string()));
            }
            self.inner.media_paths()
        }

        fn set_downloaded(&self, updates: &[(String, bool)]) -> Result<()> {
            self.inner.set_downloaded(updates)
        }

        fn is_downloaded(&self, id: &str) -> Result<bool> {
            self.inner.is_downloaded(id)
        }
    }

    #[test]
    fn test_failed_reconcile_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let inner = content_with(&[("a", "a.mp4")]);
        let content = Arc::new(FailingContent {
            inner: inner.clone(),
            failures: AtomicUsize::new(0),
        });

        let mut monitor = FilesystemMonitor::new(
            root,
            content.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        monitor.prime().unwrap();

        touch(root, "a.mp4");
        content.failures.store(1, Ordering::SeqCst);
        assert!(monitor.reconcile().is_err());
        assert!(monitor.known().is_empty());
        assert!(!inner.is_downloaded("a").unwrap());

        let changes = monitor.reconcile().unwrap();
        assert_eq!(changes.events(), vec![MonitorEvent::Added("a.mp4".to_string())]);
        assert!(inner.is_downloaded("a").unwrap());
        assert!(monitor.reconcile().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_monitor_emits_events() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let content = content_with(&[("a", "2023/a.mp4")]);

        let monitor = FilesystemMonitor::new(
            &root,
            content.clone(),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        let handle = monitor.spawn();
        let events = handle.events();

        // Let the monitor take its initial snapshot
        tokio::time::sleep(Duration::from_millis(100)).await;
        touch(&root, "2023/a.mp4");
        handle.rescan();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("monitor event")
            .unwrap();
        assert_eq!(event, MonitorEvent::Added("2023/a.mp4".to_string()));
        assert!(content.is_downloaded("a").unwrap());

        handle.stop();
    }
}
