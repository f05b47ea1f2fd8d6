//! Command implementations for the agent binary

use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use wwdc_core::{
    format_bytes, format_progress, init_database, open_database, ContentDb, Database,
    DownloadEvent, DownloadManager, DownloadService, DownloadState, DownloadsDb, Error,
    FilesystemMonitor, HttpTransport, MetadataStore, MonitorEvent, Result, SessionMedia,
    Settings, SettingsDb, SqliteMetadataStore, VariantPolicy,
};

/// A catalogue file is either a bare list of sessions or `{"sessions": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum Catalog {
    List(Vec<SessionMedia>),
    Wrapped { sessions: Vec<SessionMedia> },
}

pub fn parse_catalog(text: &str) -> Result<Vec<SessionMedia>> {
    let sessions = match serde_json::from_str::<Catalog>(text)? {
        Catalog::List(sessions) => sessions,
        Catalog::Wrapped { sessions } => sessions,
    };
    Ok(sessions)
}

pub struct Agent {
    db: Database,
    settings: Settings,
    content: Arc<ContentDb>,
}

impl Agent {
    pub fn open(db_path: Option<&Path>, storage: Option<&Path>) -> Result<Self> {
        let db = match db_path {
            Some(path) => open_database(path)?,
            None => init_database()?,
        };
        let mut settings = SettingsDb::load(&db)?;
        if let Some(storage) = storage {
            settings.storage_path = storage.to_string_lossy().into_owned();
        }
        log::debug!("Storage directory: {:?}", settings.storage_dir());

        let content = Arc::new(ContentDb::new(db.clone()));
        Ok(Self {
            db,
            settings,
            content,
        })
    }

    fn spawn_service(&self, settings: Settings) -> Result<DownloadManager> {
        let transport = HttpTransport::new(&settings.user_agent)?;
        let store = Arc::new(SqliteMetadataStore::new(self.db.clone()));
        Ok(DownloadService::new(transport, store, self.content.clone(), settings).spawn())
    }

    fn session(&self, id: &str) -> Result<SessionMedia> {
        self.content
            .get_session(id)?
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))
    }

    pub fn import(&self, catalog: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(catalog)?;
        let sessions = parse_catalog(&text)?;
        for session in &sessions {
            self.content.upsert_session(session)?;
        }
        log::info!("Imported {} sessions from {:?}", sessions.len(), catalog);
        Ok(sessions.len())
    }

    pub fn sessions(&self) -> Result<()> {
        for (id, title, downloaded) in self.content.list_sessions()? {
            let mark = if downloaded { "downloaded" } else { "-" };
            println!("{}\t{}\t{}", id, mark, title);
        }
        Ok(())
    }

    pub fn list(&self, pending: bool) -> Result<()> {
        let downloads = if pending {
            DownloadsDb::get_incomplete(&self.db)?
        } else {
            SqliteMetadataStore::new(self.db.clone()).all()?
        };
        for download in downloads {
            println!(
                "{}\t{}\t{}\t{}\t{}",
                download.id,
                download.state.status_str(),
                format_progress(download.progress()),
                download.variant,
                download.relative_path
            );
            if let Some(error) = download.error_message {
                println!("\t{}", error);
            }
        }
        Ok(())
    }

    pub fn settings(&self, key: Option<&str>, value: Option<&str>) -> Result<()> {
        match (key, value) {
            (Some(key), Some(value)) => {
                SettingsDb::set(&self.db, key, value)?;
                log::info!("Set {} = {}", key, value);
            }
            (Some(key), None) => {
                let current = serde_json::to_value(&self.settings)?;
                let value = current
                    .get(key)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown setting: {}", key)))?;
                match SettingsDb::get(&self.db, key)? {
                    Some(_) => println!("{}", display_value(value)),
                    None => println!("{} (default)", display_value(value)),
                }
            }
            (None, _) => {
                let current = serde_json::to_value(&self.settings)?;
                if let Some(map) = current.as_object() {
                    for (key, value) in map {
                        println!("{} = {}", key, display_value(value));
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns false when any download did not complete
    pub async fn download(&self, ids: &[String], streaming: bool, sd: bool) -> Result<bool> {
        let mut settings = self.settings.clone();
        if streaming {
            settings.variant_policy = VariantPolicy::PreferStreaming;
        }
        if sd {
            settings.prefer_hd = false;
        }

        let manager = self.spawn_service(settings)?;
        let mut events = manager.subscribe();
        let mut ok = true;

        let mut started = Vec::new();
        for id in ids {
            let result = match self.session(id) {
                Ok(session) => manager.start_download(&session).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(download) => {
                    log::info!("Queued {} ({})", download.title, download.variant);
                    started.push(id.clone());
                }
                Err(e) => {
                    log::error!("Cannot download {}: {}", id, e);
                    ok = false;
                }
            }
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        while has_pending(&manager, &started) {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(DownloadEvent::StateChanged { id, state }) => match state {
                        DownloadState::Downloading { .. } => log::debug!("{}: {}", id, state),
                        _ => log::info!("{}: {}", id, state),
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => log::debug!("Skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                },
                _ = &mut ctrl_c => {
                    log::info!("Interrupted, pausing downloads");
                    ok = false;
                    break;
                }
            }
        }

        for id in &started {
            match manager.download(id) {
                Some(download) => {
                    if download.state != DownloadState::Completed {
                        ok = false;
                    }
                    let path = self.settings.storage_dir().join(&download.relative_path);
                    match (download.error_message, std::fs::metadata(&path)) {
                        (Some(error), _) => println!("{}\t{}\t{}", id, download.state, error),
                        (None, Ok(meta)) => {
                            println!("{}\t{}\t{}", id, download.state, format_bytes(meta.len()))
                        }
                        (None, Err(_)) => println!("{}\t{}", id, download.state),
                    }
                }
                None => {
                    ok = false;
                    println!("{}\tcancelled", id);
                }
            }
        }

        manager.shutdown().await?;
        Ok(ok)
    }

    pub async fn remove(&self, ids: &[String]) -> Result<()> {
        let manager = self.spawn_service(self.settings.clone())?;
        for id in ids {
            let session = self.session(id)?;
            manager.remove_downloaded_media(&session).await?;
            println!("{}\tremoved", id);
        }
        manager.shutdown().await
    }

    pub async fn run(&self) -> Result<()> {
        let manager = self.spawn_service(self.settings.clone())?;
        let monitor =
            FilesystemMonitor::from_settings(&self.settings, self.content.clone()).spawn();
        let monitor_events = monitor.events();
        let mut events = manager.subscribe();

        log::info!(
            "Agent running with {} downloads, press Ctrl-C to stop",
            manager.downloads().len()
        );

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                event = monitor_events.recv() => match event {
                    Ok(MonitorEvent::Added(path)) => log::info!("Media added: {}", path),
                    Ok(MonitorEvent::Removed(path)) => log::info!("Media removed: {}", path),
                    Err(_) => {
                        log::warn!("Filesystem monitor stopped");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Ok(DownloadEvent::Added(download)) => {
                        log::info!("Download added: {}", download.title)
                    }
                    Ok(DownloadEvent::StateChanged { id, state }) => match state {
                        DownloadState::Downloading { .. } => log::debug!("{}: {}", id, state),
                        _ => log::info!("{}: {}", id, state),
                    },
                    Ok(DownloadEvent::Removed(id)) => log::info!("Download removed: {}", id),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                _ = &mut ctrl_c => {
                    log::info!("Shutting down");
                    break;
                }
            }
        }

        monitor.stop();
        manager.shutdown().await
    }
}

fn has_pending(manager: &DownloadManager, ids: &[String]) -> bool {
    ids.iter()
        .any(|id| manager.download(id).is_some_and(|d| !d.state.is_terminal()))
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
