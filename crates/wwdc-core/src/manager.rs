//! Cloneable handle to a running [`DownloadService`](crate::service::DownloadService)

use tokio::sync::{broadcast, oneshot, watch};

use crate::error::{Error, Result};
use crate::media::{MediaContainer, SessionMedia};
use crate::service::{DownloadCommand, DownloadEvent, StateWatchers};
use crate::types::{Download, DownloadState};

#[derive(Clone)]
pub struct DownloadManager {
    cmd_tx: async_channel::Sender<DownloadCommand>,
    list_rx: watch::Receiver<Vec<Download>>,
    event_tx: broadcast::Sender<DownloadEvent>,
    watchers: StateWatchers,
}

impl DownloadManager {
    pub(crate) fn new(
        cmd_tx: async_channel::Sender<DownloadCommand>,
        list_rx: watch::Receiver<Vec<Download>>,
        event_tx: broadcast::Sender<DownloadEvent>,
        watchers: StateWatchers,
    ) -> Self {
        Self {
            cmd_tx,
            list_rx,
            event_tx,
            watchers,
        }
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> DownloadCommand,
    ) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ServiceStopped)?;
        Ok(rx.await?)
    }

    /// Start downloading the preferred variant of `container`.
    ///
    /// Fails with [`Error::AlreadyDownloading`] while another transfer for
    /// the same identifier is waiting, running or paused.
    pub async fn start_download<C: MediaContainer + ?Sized>(
        &self,
        container: &C,
    ) -> Result<Download> {
        let media = SessionMedia::snapshot(container);
        self.request(|reply| DownloadCommand::Start { media, reply })
            .await?
    }

    /// Cancel downloads. Unknown or finished ids are ignored; the ids that
    /// were actually cancelled are returned.
    pub async fn cancel_download<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<String>> {
        let ids = ids.iter().map(|id| id.as_ref().to_string()).collect();
        self.request(|reply| DownloadCommand::Cancel { ids, reply }).await
    }

    pub async fn pause_download(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| DownloadCommand::Pause { id, reply })
            .await?
    }

    pub async fn resume_download(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| DownloadCommand::Resume { id, reply })
            .await?
    }

    /// Delete the local files and metadata of `container`. Missing files are
    /// not an error.
    pub async fn remove_downloaded_media<C: MediaContainer + ?Sized>(
        &self,
        container: &C,
    ) -> Result<()> {
        let media = SessionMedia::snapshot(container);
        self.request(|reply| DownloadCommand::Remove { media, reply })
            .await?
    }

    /// Pause running transfers and stop the service
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| DownloadCommand::Shutdown { reply }).await
    }

    /// Current list of known downloads
    pub fn downloads(&self) -> Vec<Download> {
        self.list_rx.borrow().clone()
    }

    pub fn download(&self, id: &str) -> Option<Download> {
        self.list_rx.borrow().iter().find(|d| d.id == id).cloned()
    }

    pub fn is_downloading(&self, id: &str) -> bool {
        self.download(id).is_some_and(|d| d.is_active())
    }

    /// State stream of one download, if it is known
    pub fn state_stream(&self, id: &str) -> Option<watch::Receiver<DownloadState>> {
        self.watchers.read().ok()?.get(id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }
}
