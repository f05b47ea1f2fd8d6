//! Download service - owns every download's state on a single task
//!
//! Commands from [`DownloadManager`](crate::manager::DownloadManager)
//! handles and events from transfer tasks are processed by the same loop,
//! so state transitions never race each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, oneshot, watch};

use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::manager::DownloadManager;
use crate::media::{validate_relative_path, MediaContainer, SessionMedia};
use crate::store::MetadataStore;
use crate::transfer::{
    partial_path, ProgressSink, TransferControl, TransferEvent, TransferRequest, Transport,
};
use crate::types::{Download, DownloadState, Settings};

/// Progress is persisted after advancing at least this much
const PERSIST_STEP: f64 = 0.01;

/// Commands sent from manager handles to the service
#[derive(Debug)]
pub enum DownloadCommand {
    /// Start downloading the preferred variant of a container
    Start {
        media: SessionMedia,
        reply: oneshot::Sender<Result<Download>>,
    },
    /// Pause a running download
    Pause {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Resume a paused download
    Resume {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Cancel downloads; replies with the ids that were actually cancelled
    Cancel {
        ids: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Delete downloaded files and metadata of a container
    Remove {
        media: SessionMedia,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Pause everything and stop the service
    Shutdown { reply: oneshot::Sender<()> },
}

/// Notifications for observers
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// A download was added
    Added(Download),
    /// A download changed state
    StateChanged { id: String, state: DownloadState },
    /// A download's metadata was removed
    Removed(String),
}

/// Shared per-download state receivers, read by manager handles
pub(crate) type StateWatchers = Arc<RwLock<HashMap<String, watch::Receiver<DownloadState>>>>;

struct Entry {
    download: Download,
    state_tx: watch::Sender<DownloadState>,
    control: Option<watch::Sender<TransferControl>>,
    task_running: bool,
    last_persisted: f64,
}

/// Download service; construct it, then [`spawn`](Self::spawn) it
pub struct DownloadService<T: Transport> {
    transport: Arc<T>,
    store: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
    settings: Settings,
    entries: HashMap<String, Entry>,
    /// Cancelled downloads whose transfer task has not stopped yet, with
    /// the destination to clean up
    cancelling: HashMap<String, PathBuf>,
    transfer_tx: async_channel::Sender<TransferEvent>,
    transfer_rx: async_channel::Receiver<TransferEvent>,
    list_tx: watch::Sender<Vec<Download>>,
    event_tx: broadcast::Sender<DownloadEvent>,
    watchers: StateWatchers,
}

impl<T: Transport> DownloadService<T> {
    pub fn new(
        transport: T,
        store: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
        settings: Settings,
    ) -> Self {
        let (transfer_tx, transfer_rx) = async_channel::bounded(256);
        let (list_tx, _) = watch::channel(Vec::new());
        let (event_tx, _) = broadcast::channel(256);
        Self {
            transport: Arc::new(transport),
            store,
            content,
            settings,
            entries: HashMap::new(),
            cancelling: HashMap::new(),
            transfer_tx,
            transfer_rx,
            list_tx,
            event_tx,
            watchers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Restore persisted downloads and run the service on the current tokio
    /// runtime. Returns a handle for issuing commands.
    pub fn spawn(mut self) -> DownloadManager {
        let (cmd_tx, cmd_rx) = async_channel::bounded::<DownloadCommand>(100);
        let transfer_rx = self.transfer_rx.clone();

        self.restore();

        let manager = DownloadManager::new(
            cmd_tx,
            self.list_tx.subscribe(),
            self.event_tx.clone(),
            self.watchers.clone(),
        );

        tokio::spawn(async move {
            self.run(cmd_rx, transfer_rx).await;
        });

        manager
    }

    async fn run(
        mut self,
        cmd_rx: async_channel::Receiver<DownloadCommand>,
        transfer_rx: async_channel::Receiver<TransferEvent>,
    ) {
        log::info!("Download service started with {} known downloads", self.entries.len());

        loop {
            tokio::select! {
                // Handle commands from manager handles
                cmd_result = cmd_rx.recv() => {
                    match cmd_result {
                        Ok(DownloadCommand::Shutdown { reply }) => {
                            log::info!("Download service shutting down");
                            self.pause_all_for_shutdown();
                            let _ = reply.send(());
                            break;
                        }
                        Ok(cmd) => self.handle_command(cmd).await,
                        Err(_) => {
                            log::warn!("Command channel closed");
                            self.pause_all_for_shutdown();
                            break;
                        }
                    }
                }

                // Handle events from transfer tasks
                event_result = transfer_rx.recv() => {
                    if let Ok(event) = event_result {
                        self.handle_transfer_event(event).await;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: DownloadCommand) {
        match cmd {
            DownloadCommand::Start { media, reply } => {
                let _ = reply.send(self.start(media));
            }
            DownloadCommand::Pause { id, reply } => {
                let _ = reply.send(self.pause(&id));
            }
            DownloadCommand::Resume { id, reply } => {
                let _ = reply.send(self.resume(&id));
            }
            DownloadCommand::Cancel { ids, reply } => {
                let cancelled = self.cancel(&ids).await;
                let _ = reply.send(cancelled);
            }
            DownloadCommand::Remove { media, reply } => {
                let _ = reply.send(self.remove_media(&media).await);
            }
            DownloadCommand::Shutdown { .. } => {
                // Handled in the main loop
            }
        }
    }

    fn storage_path(&self, relative_path: &str) -> PathBuf {
        self.settings.storage_dir().join(relative_path)
    }

    fn start(&mut self, media: SessionMedia) -> Result<Download> {
        let id = media.identifier().to_string();

        if self.entries.get(&id).is_some_and(|e| e.download.is_active())
            || self.cancelling.contains_key(&id)
        {
            return Err(Error::AlreadyDownloading(id));
        }

        let variant = self
            .settings
            .variant_policy
            .select(&media, self.settings.prefer_hd)
            .ok_or_else(|| Error::NoDownloadableVariant(id.clone()))?;
        let remote_url = media
            .remote_url(variant)
            .ok_or_else(|| Error::NoDownloadableVariant(id.clone()))?;
        let relative_path = media
            .relative_path(variant)
            .ok_or_else(|| Error::NoDownloadableVariant(id.clone()))?;
        validate_relative_path(relative_path).map_err(Error::InvalidInput)?;

        let download = Download::new(&id, media.title(), remote_url, relative_path, variant);

        // Persist before acknowledging
        if let Err(e) = self.store.put(&download) {
            log::warn!("Failed to persist download {}: {}", id, e);
        }

        log::info!("Starting download of {} ({})", download.title, variant);
        self.insert_entry(download.clone());
        self.launch(&id);
        let _ = self.event_tx.send(DownloadEvent::Added(download.clone()));
        self.publish_list();

        Ok(download)
    }

    fn insert_entry(&mut self, download: Download) {
        let (state_tx, state_rx) = watch::channel(download.state);
        if let Ok(mut watchers) = self.watchers.write() {
            watchers.insert(download.id.clone(), state_rx);
        }
        let last_persisted = download.progress();
        self.entries.insert(
            download.id.clone(),
            Entry {
                download,
                state_tx,
                control: None,
                task_running: false,
                last_persisted,
            },
        );
    }

    /// Spawn the transfer task for an entry
    fn launch(&mut self, id: &str) {
        let storage = self.settings.storage_dir();
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };

        let (control_tx, control_rx) = watch::channel(TransferControl::Run);
        entry.control = Some(control_tx);
        entry.task_running = true;

        let request = TransferRequest {
            id: id.to_string(),
            url: entry.download.remote_url.clone(),
            destination: storage.join(&entry.download.relative_path),
            segmented: entry.download.variant.is_segmented(),
        };
        let transport = Arc::clone(&self.transport);
        let events = self.transfer_tx.clone();
        let sink = ProgressSink::new(id, events.clone());
        let id = id.to_string();

        tokio::spawn(async move {
            let outcome = transport.fetch(request, sink, control_rx).await;
            let _ = events.send(TransferEvent::from_outcome(id, outcome)).await;
        });
    }

    fn pause(&mut self, id: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        match entry.download.state {
            DownloadState::Waiting | DownloadState::Downloading { .. } => {}
            other => {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    message: format!("cannot pause a download that is {}", other),
                })
            }
        }

        if let Some(control) = &entry.control {
            control.send_replace(TransferControl::Pause);
        }
        let progress = entry.download.progress();
        self.set_state(id, DownloadState::paused(progress));
        self.persist_state(id);
        Ok(())
    }

    fn resume(&mut self, id: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let DownloadState::Paused { progress } = entry.download.state else {
            return Err(Error::InvalidState {
                id: id.to_string(),
                message: format!("cannot resume a download that is {}", entry.download.state),
            });
        };

        let running = entry.task_running;
        if running {
            // The task has not stopped yet; let it carry on
            if let Some(control) = &entry.control {
                control.send_replace(TransferControl::Run);
            }
        }

        self.set_state(id, DownloadState::downloading(progress));
        self.persist_state(id);
        if !running {
            self.launch(id);
        }
        Ok(())
    }

    async fn cancel(&mut self, ids: &[String]) -> Vec<String> {
        let mut cancelled = Vec::new();

        for id in ids {
            let Some(entry) = self.entries.get(id) else {
                log::debug!("Ignoring cancel for {}: unknown download", id);
                continue;
            };

            if entry.download.state == DownloadState::Failed && !entry.task_running {
                // Nothing is running, so cancelling just forgets the record
                let destination = self.storage_path(&entry.download.relative_path);
                if let Err(e) = self.store.remove(id) {
                    log::warn!("Failed to remove metadata for {}: {}", id, e);
                }
                remove_file_if_present(&partial_path(&destination)).await;
                self.drop_entry(id);
                log::info!("Discarded failed download {}", id);
                cancelled.push(id.clone());
                continue;
            }

            if !entry.download.is_active() {
                log::debug!("Ignoring cancel for {}: not active", id);
                continue;
            }

            let (running, relative_path) = {
                let entry = &self.entries[id];
                if let Some(control) = &entry.control {
                    control.send_replace(TransferControl::Cancel);
                }
                (entry.task_running, entry.download.relative_path.clone())
            };

            self.set_state(id, DownloadState::Cancelled);
            if let Err(e) = self.store.remove(id) {
                log::warn!("Failed to remove metadata for {}: {}", id, e);
            }

            let destination = self.storage_path(&relative_path);
            if running {
                // Partial data is cleaned up once the task reports back
                self.cancelling.insert(id.clone(), destination);
            } else {
                remove_file_if_present(&partial_path(&destination)).await;
            }

            self.drop_entry(id);
            log::info!("Cancelled download {}", id);
            cancelled.push(id.clone());
        }

        if !cancelled.is_empty() {
            self.publish_list();
        }
        cancelled
    }

    async fn remove_media(&mut self, media: &SessionMedia) -> Result<()> {
        let id = media.identifier().to_string();
        if self.entries.get(&id).is_some_and(|e| e.download.is_active())
            || self.cancelling.contains_key(&id)
        {
            return Err(Error::AlreadyDownloading(id));
        }

        for variant in media.variants() {
            let Some(relative_path) = media.relative_path(variant) else {
                continue;
            };
            if validate_relative_path(relative_path).is_err() {
                log::warn!("Refusing to delete {} for {}", relative_path, id);
                continue;
            }
            let path = self.storage_path(relative_path);
            remove_file_if_present(&path).await;
            remove_file_if_present(&partial_path(&path)).await;
        }

        if let Err(e) = self.store.remove(&id) {
            log::warn!("Failed to remove metadata for {}: {}", id, e);
        }
        if let Err(e) = self.content.set_downloaded(&[(id.clone(), false)]) {
            log::warn!("Failed to clear downloaded flag for {}: {}", id, e);
        }

        if self.entries.contains_key(&id) {
            self.drop_entry(&id);
            self.publish_list();
        }

        log::info!("Removed downloaded media for {}", id);
        Ok(())
    }

    async fn handle_transfer_event(&mut self, event: TransferEvent) {
        let id = event.id().to_string();

        if self.cancelling.contains_key(&id) {
            match event {
                TransferEvent::Progress { .. } => {}
                // Finished before it saw the cancel; the user still wants it gone
                TransferEvent::Finished { .. } => self.cleanup_cancelled(&id, true).await,
                _ => self.cleanup_cancelled(&id, false).await,
            }
            return;
        }

        let Some(state) = self.entries.get(&id).map(|e| e.download.state) else {
            log::debug!("Dropping transfer event for unknown download {}", id);
            return;
        };

        match event {
            TransferEvent::Progress { progress, .. } => match state {
                DownloadState::Waiting | DownloadState::Downloading { .. } => {
                    self.set_state(&id, DownloadState::downloading(progress));
                    self.persist_progress(&id);
                }
                DownloadState::Paused { .. } => {
                    self.set_state(&id, DownloadState::paused(progress));
                }
                _ => {}
            },
            TransferEvent::Paused { .. } => {
                self.mark_stopped(&id);
                if matches!(state, DownloadState::Waiting | DownloadState::Downloading { .. }) {
                    // Resumed after the task had already stopped
                    self.launch(&id);
                } else {
                    self.persist_state(&id);
                }
            }
            TransferEvent::Cancelled { .. } => {
                // User cancels go through `cancelling`
                self.mark_stopped(&id);
            }
            TransferEvent::Finished { .. } => {
                self.mark_stopped(&id);
                self.finish(&id).await;
            }
            TransferEvent::Failed { error, .. } => {
                self.mark_stopped(&id);
                log::error!("Download failed: {} - {}", id, error);
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.download.error_message = Some(error);
                }
                self.set_state(&id, DownloadState::Failed);
                self.persist_state(&id);
            }
        }
    }

    fn mark_stopped(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.task_running = false;
            entry.control = None;
        }
    }

    /// A transfer reported success; trust it only once the file is on disk
    async fn finish(&mut self, id: &str) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        let path = self.storage_path(&entry.download.relative_path);
        let title = entry.download.title.clone();

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            log::info!("Download completed: {}", title);
            self.set_state(id, DownloadState::Completed);
            if let Err(e) = self.content.set_downloaded(&[(id.to_string(), true)]) {
                log::warn!("Failed to set downloaded flag for {}: {}", id, e);
            }
            // Confirmed on disk, so the metadata is no longer needed
            if let Err(e) = self.store.remove(id) {
                log::warn!("Failed to prune metadata for {}: {}", id, e);
            }
        } else {
            log::error!("Download {} finished but {:?} is missing", id, path);
            if let Some(entry) = self.entries.get_mut(id) {
                entry.download.error_message =
                    Some(format!("file missing after transfer: {}", path.display()));
            }
            self.set_state(id, DownloadState::Failed);
            self.persist_state(id);
        }
    }

    async fn cleanup_cancelled(&mut self, id: &str, finished: bool) {
        if let Some(destination) = self.cancelling.remove(id) {
            remove_file_if_present(&partial_path(&destination)).await;
            if finished {
                remove_file_if_present(&destination).await;
            }
        }
    }

    fn set_state(&mut self, id: &str, state: DownloadState) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.download.state == state {
            return;
        }
        entry.download.state = state;
        entry.download.updated_at = chrono::Utc::now().to_rfc3339();
        if state != DownloadState::Failed {
            entry.download.error_message = None;
        }
        entry.state_tx.send_replace(state);
        let _ = self.event_tx.send(DownloadEvent::StateChanged {
            id: id.to_string(),
            state,
        });
        self.publish_list();
    }

    fn persist_state(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.last_persisted = entry.download.progress();
        if let Err(e) = self.store.put(&entry.download) {
            log::warn!("Failed to persist state of {}: {}", id, e);
        }
    }

    fn persist_progress(&mut self, id: &str) {
        let advanced = self
            .entries
            .get(id)
            .is_some_and(|e| e.download.progress() - e.last_persisted >= PERSIST_STEP);
        if advanced {
            self.persist_state(id);
        }
    }

    /// Remove an entry from memory; observers keep the final state
    fn drop_entry(&mut self, id: &str) {
        if self.entries.remove(id).is_some() {
            let _ = self.event_tx.send(DownloadEvent::Removed(id.to_string()));
        }
        if let Ok(mut watchers) = self.watchers.write() {
            watchers.remove(id);
        }
    }

    fn publish_list(&self) {
        let mut list: Vec<Download> = self.entries.values().map(|e| e.download.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        self.list_tx.send_replace(list);
    }

    /// Bring persisted downloads back after a relaunch
    fn restore(&mut self) {
        let records = match self.store.all() {
            Ok(records) => records,
            Err(e) => {
                log::error!("Failed to load download metadata: {}", e);
                return;
            }
        };

        let mut to_resume = Vec::new();
        for mut download in records {
            let id = download.id.clone();
            match download.state {
                DownloadState::Waiting
                | DownloadState::Downloading { .. }
                | DownloadState::Paused { .. } => {
                    download.state = DownloadState::paused(download.progress());
                    self.insert_entry(download);
                    self.persist_state(&id);
                    to_resume.push(id);
                }
                DownloadState::Failed => self.insert_entry(download),
                DownloadState::Completed => {
                    let present = self.storage_path(&download.relative_path).is_file();
                    if present {
                        if let Err(e) = self.content.set_downloaded(&[(id.clone(), true)]) {
                            log::warn!("Failed to set downloaded flag for {}: {}", id, e);
                        }
                    }
                    if let Err(e) = self.store.remove(&id) {
                        log::warn!("Failed to prune metadata for {}: {}", id, e);
                    }
                }
                DownloadState::Cancelled => {
                    if let Err(e) = self.store.remove(&id) {
                        log::warn!("Failed to prune metadata for {}: {}", id, e);
                    }
                }
            }
        }

        if self.settings.resume_on_launch {
            for id in to_resume {
                if let Err(e) = self.resume(&id) {
                    log::warn!("Failed to resume {}: {}", id, e);
                }
            }
        }
        self.publish_list();
    }

    fn pause_all_for_shutdown(&mut self) {
        let running: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.task_running)
            .map(|(id, _)| id.clone())
            .collect();
        for id in running {
            if let Some(entry) = self.entries.get(&id) {
                if let Some(control) = &entry.control {
                    control.send_replace(TransferControl::Pause);
                }
            }
            let progress = self.entries.get(&id).map(|e| e.download.progress()).unwrap_or(0.0);
            if self.entries.get(&id).is_some_and(|e| e.download.is_active()) {
                self.set_state(&id, DownloadState::paused(progress));
            }
            self.persist_state(&id);
        }
    }
}

async fn remove_file_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Deleted {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to delete {:?}: {}", path, e),
    }
}
