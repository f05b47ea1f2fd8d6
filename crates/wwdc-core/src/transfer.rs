//! Transfers - moving one media variant from its remote URL to disk
//!
//! A transfer writes into `<destination>.part` and renames on success, so a
//! file at the final path is always complete. Pause and cancel are
//! cooperative: the transfer checks its control channel between chunks.

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{StatusCode, Url};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::hls::{self, Playlist};
use crate::utils::calculate_progress;

pub const PARTIAL_EXTENSION: &str = "part";

/// What a running transfer should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    Run,
    Pause,
    Cancel,
}

/// How a transfer ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Finished,
    Paused,
    Cancelled,
}

/// Reported by transfer tasks back to the download service
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress { id: String, progress: f64 },
    Finished { id: String },
    Paused { id: String },
    Cancelled { id: String },
    Failed { id: String, error: String },
}

impl TransferEvent {
    pub fn id(&self) -> &str {
        match self {
            TransferEvent::Progress { id, .. }
            | TransferEvent::Finished { id }
            | TransferEvent::Paused { id }
            | TransferEvent::Cancelled { id }
            | TransferEvent::Failed { id, .. } => id,
        }
    }

    pub fn from_outcome(id: String, outcome: Result<TransferOutcome>) -> Self {
        match outcome {
            Ok(TransferOutcome::Finished) => TransferEvent::Finished { id },
            Ok(TransferOutcome::Paused) => TransferEvent::Paused { id },
            Ok(TransferOutcome::Cancelled) => TransferEvent::Cancelled { id },
            Err(e) => TransferEvent::Failed {
                id,
                error: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    /// Fetch as an HLS playlist instead of a single file
    pub segmented: bool,
}

/// Path of the in-progress file for a destination
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_EXTENSION);
    PathBuf::from(name)
}

/// Sends throttled progress for one transfer
pub struct ProgressSink {
    id: String,
    tx: async_channel::Sender<TransferEvent>,
    last: f64,
}

impl ProgressSink {
    pub fn new(id: impl Into<String>, tx: async_channel::Sender<TransferEvent>) -> Self {
        Self {
            id: id.into(),
            tx,
            last: -1.0,
        }
    }

    pub async fn report(&mut self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        if progress - self.last < 0.001 && progress < 1.0 {
            return;
        }
        self.last = progress;
        let _ = self
            .tx
            .send(TransferEvent::Progress {
                id: self.id.clone(),
                progress,
            })
            .await;
    }

    pub async fn report_bytes(&mut self, written: u64, total: Option<u64>) {
        let progress = total.map(|t| calculate_progress(written, t)).unwrap_or(0.0);
        self.report(progress).await;
    }
}

/// The mechanism that actually moves bytes
pub trait Transport: Send + Sync + 'static {
    fn fetch(
        &self,
        request: TransferRequest,
        sink: ProgressSink,
        control: watch::Receiver<TransferControl>,
    ) -> impl Future<Output = Result<TransferOutcome>> + Send;
}

/// Waits for the next control change. A dropped sender means the service is
/// gone, which is treated as a pause so partial data is kept.
async fn next_control(control: &mut watch::Receiver<TransferControl>) -> TransferControl {
    match control.changed().await {
        Ok(()) => *control.borrow_and_update(),
        Err(_) => TransferControl::Pause,
    }
}

/// HTTP transport built on reqwest
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (proxies, TLS roots, timeouts)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_file(
        &self,
        request: &TransferRequest,
        sink: &mut ProgressSink,
        control: &mut watch::Receiver<TransferControl>,
    ) -> Result<TransferOutcome> {
        let part = partial_path(&request.destination);
        let offset = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);

        let mut builder = self.client.get(&request.url);
        if offset > 0 {
            log::debug!("Resuming {} at byte {}", request.id, offset);
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            // The partial file already holds everything
            tokio::fs::rename(&part, &request.destination).await?;
            sink.report(1.0).await;
            return Ok(TransferOutcome::Finished);
        }
        if !status.is_success() {
            return Err(Error::Network(format!(
                "Failed to download {}: HTTP {}",
                request.url, status
            )));
        }

        let append = status == StatusCode::PARTIAL_CONTENT;
        let mut written = if append { offset } else { 0 };
        let total = response.content_length().map(|len| len + written);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&part)
            .await?;
        let mut stream = response.bytes_stream();

        sink.report_bytes(written, total).await;

        loop {
            tokio::select! {
                next = next_control(control) => match next {
                    TransferControl::Run => {}
                    TransferControl::Pause => {
                        file.flush().await?;
                        return Ok(TransferOutcome::Paused);
                    }
                    TransferControl::Cancel => return Ok(TransferOutcome::Cancelled),
                },
                chunk = stream.next() => match chunk {
                    Some(chunk) => {
                        let chunk = chunk?;
                        file.write_all(&chunk).await?;
                        written += chunk.len() as u64;
                        sink.report_bytes(written, total).await;
                    }
                    None => break,
                },
            }
        }

        file.flush().await?;
        drop(file);

        if let Some(expected) = total {
            if written < expected {
                return Err(Error::Network(format!(
                    "Connection closed after {} of {} bytes",
                    written, expected
                )));
            }
        }

        tokio::fs::rename(&part, &request.destination).await?;
        sink.report(1.0).await;
        Ok(TransferOutcome::Finished)
    }

    async fn get_text(&self, url: &Url) -> Result<String> {
        let text = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text)
    }

    async fn fetch_segmented(
        &self,
        request: &TransferRequest,
        sink: &mut ProgressSink,
        control: &mut watch::Receiver<TransferControl>,
    ) -> Result<TransferOutcome> {
        let base = Url::parse(&request.url)
            .map_err(|e| Error::InvalidInput(format!("bad URL {}: {}", request.url, e)))?;

        let segments = match hls::parse_playlist(&self.get_text(&base).await?, &base)? {
            Playlist::Media(segments) => segments,
            Playlist::Master(variants) => {
                let best = hls::best_variant(&variants)
                    .ok_or_else(|| Error::InvalidInput("empty master playlist".to_string()))?;
                log::debug!("Using {} bps stream for {}", best.bandwidth, request.id);
                match hls::parse_playlist(&self.get_text(&best.uri).await?, &best.uri)? {
                    Playlist::Media(segments) => segments,
                    Playlist::Master(_) => {
                        return Err(Error::InvalidInput("nested master playlist".to_string()))
                    }
                }
            }
        };

        if segments.is_empty() {
            return Err(Error::InvalidInput(format!(
                "playlist {} has no segments",
                request.url
            )));
        }

        // Segment boundaries are not tracked, so a resumed stream starts over
        let part = partial_path(&request.destination);
        let mut file = tokio::fs::File::create(&part).await?;
        let count = segments.len();
        sink.report(0.0).await;

        for (index, segment) in segments.into_iter().enumerate() {
            let fetch = fetch_segment(&self.client, segment);
            tokio::pin!(fetch);
            let bytes = loop {
                tokio::select! {
                    next = next_control(control) => match next {
                        TransferControl::Run => continue,
                        TransferControl::Pause => {
                            file.flush().await?;
                            return Ok(TransferOutcome::Paused);
                        }
                        TransferControl::Cancel => return Ok(TransferOutcome::Cancelled),
                    },
                    bytes = &mut fetch => break bytes?,
                }
            };
            file.write_all(&bytes).await?;
            sink.report((index + 1) as f64 / count as f64).await;
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, &request.destination).await?;
        Ok(TransferOutcome::Finished)
    }
}

async fn fetch_segment(client: &reqwest::Client, segment: Url) -> Result<Vec<u8>> {
    let bytes = client
        .get(segment)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    Ok(bytes.to_vec())
}

impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: TransferRequest,
        mut sink: ProgressSink,
        mut control: watch::Receiver<TransferControl>,
    ) -> Result<TransferOutcome> {
        match *control.borrow_and_update() {
            TransferControl::Run => {}
            TransferControl::Pause => return Ok(TransferOutcome::Paused),
            TransferControl::Cancel => return Ok(TransferOutcome::Cancelled),
        }

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        log::info!("Downloading {} to {:?}", request.url, request.destination);
        if request.segmented {
            self.fetch_segmented(&request, &mut sink, &mut control).await
        } else {
            self.fetch_file(&request, &mut sink, &mut control).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    type Requests = Arc<Mutex<Vec<(String, Option<String>)>>>;

    fn response(status: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
        for (name, value) in headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(body);
        bytes
    }

    fn ok(body: &[u8]) -> Vec<u8> {
        response("200 OK", &[("Content-Length", body.len().to_string())], body)
    }

    fn not_found() -> Vec<u8> {
        response("404 Not Found", &[("Content-Length", "0".to_string())], b"")
    }

    /// Serves canned responses, recording each request's path and Range header
    async fn serve<F>(handler: F) -> (String, Requests)
    where
        F: Fn(&str, Option<&str>) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let handler = handler.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let path = head
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    let range = head.lines().find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("range")
                            .then(|| value.trim().to_string())
                    });

                    let reply = (*handler)(path.as_str(), range.as_deref());
                    seen.lock().unwrap().push((path, range));
                    let _ = socket.write_all(&reply).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}", addr), requests)
    }

    fn transport() -> HttpTransport {
        HttpTransport::with_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    fn request(url: String, destination: PathBuf, segmented: bool) -> TransferRequest {
        TransferRequest {
            id: "wwdc2024-10144".to_string(),
            url,
            destination,
            segmented,
        }
    }

    /// Run one transfer to completion, returning its outcome and progress reports
    async fn run(
        transport: &HttpTransport,
        request: TransferRequest,
        initial: TransferControl,
    ) -> (Result<TransferOutcome>, Vec<f64>) {
        let (tx, rx) = async_channel::unbounded();
        let (_control_tx, control_rx) = watch::channel(initial);
        let sink = ProgressSink::new(request.id.clone(), tx);
        let outcome = transport.fetch(request, sink, control_rx).await;

        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransferEvent::Progress { progress: p, .. } = event {
                progress.push(p);
            }
        }
        (outcome, progress)
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/media/2024/10144_hd.mp4")),
            PathBuf::from("/media/2024/10144_hd.mp4.part")
        );
    }

    #[tokio::test]
    async fn test_progress_sink_throttles() {
        let (tx, rx) = async_channel::unbounded();
        let mut sink = ProgressSink::new("a", tx);
        sink.report_bytes(20, Some(200)).await;
        sink.report(0.1005).await;
        sink.report_bytes(40, Some(200)).await;
        // Going backwards or an unknown length is not worth a report
        sink.report_bytes(5, None).await;
        sink.report(1.0).await;
        sink.report(1.0).await;

        let mut reported = Vec::new();
        while let Ok(TransferEvent::Progress { progress, .. }) = rx.try_recv() {
            reported.push(progress);
        }
        assert_eq!(reported, vec![0.1, 0.2, 1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_fresh_download_is_renamed_on_success() {
        let (base, requests) = serve(|_, _| ok(b"0123456789")).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("2024").join("10144_hd.mp4");

        let (outcome, progress) = run(
            &transport(),
            request(format!("{}/10144_hd.mp4", base), dest.clone(), false),
            TransferControl::Run,
        )
        .await;

        assert_eq!(outcome.unwrap(), TransferOutcome::Finished);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
        assert!(!partial_path(&dest).exists());
        assert_eq!(progress.last(), Some(&1.0));
        assert_eq!(requests.lock().unwrap()[0].1, None);
    }

    #[tokio::test]
    async fn test_resume_appends_from_partial_length() {
        let (base, requests) = serve(|_, range| match range {
            Some("bytes=5-") => response(
                "206 Partial Content",
                &[
                    ("Content-Length", "5".to_string()),
                    ("Content-Range", "bytes 5-9/10".to_string()),
                ],
                b"56789",
            ),
            _ => ok(b"0123456789"),
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("10144_hd.mp4");
        std::fs::write(partial_path(&dest), b"01234").unwrap();

        let (outcome, _) = run(
            &transport(),
            request(format!("{}/10144_hd.mp4", base), dest.clone(), false),
            TransferControl::Run,
        )
        .await;

        assert_eq!(outcome.unwrap(), TransferOutcome::Finished);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
        assert_eq!(requests.lock().unwrap()[0].1.as_deref(), Some("bytes=5-"));
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_the_file() {
        let (base, requests) = serve(|_, _| ok(b"0123456789")).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("10144_hd.mp4");
        std::fs::write(partial_path(&dest), b"stale").unwrap();

        let (outcome, _) = run(
            &transport(),
            request(format!("{}/10144_hd.mp4", base), dest.clone(), false),
            TransferControl::Run,
        )
        .await;

        assert_eq!(outcome.unwrap(), TransferOutcome::Finished);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
        assert_eq!(requests.lock().unwrap()[0].1.as_deref(), Some("bytes=5-"));
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_means_complete() {
        let (base, _) = serve(|_, _| {
            response(
                "416 Range Not Satisfiable",
                &[
                    ("Content-Length", "0".to_string()),
                    ("Content-Range", "bytes */10".to_string()),
                ],
                b"",
            )
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("10144_hd.mp4");
        std::fs::write(partial_path(&dest), b"0123456789").unwrap();

        let (outcome, progress) = run(
            &transport(),
            request(format!("{}/10144_hd.mp4", base), dest.clone(), false),
            TransferControl::Run,
        )
        .await;

        assert_eq!(outcome.unwrap(), TransferOutcome::Finished);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
        assert!(!partial_path(&dest).exists());
        assert_eq!(progress, vec![1.0]);
    }

    #[tokio::test]
    async fn test_http_errors_and_short_bodies_fail() {
        let (base, _) = serve(|path, _| match path {
            "/missing.mp4" => not_found(),
            // Promises more than it sends, then hangs up
            _ => response("200 OK", &[("Content-Length", "100".to_string())], b"0123"),
        })
        .await;
        let dir = tempfile::tempdir().unwrap();

        for name in ["missing.mp4", "short.mp4"] {
            let dest = dir.path().join(name);
            let (outcome, _) = run(
                &transport(),
                request(format!("{}/{}", base, name), dest.clone(), false),
                TransferControl::Run,
            )
            .await;
            assert!(matches!(outcome, Err(Error::Network(_))), "{}: {:?}", name, outcome);
            assert!(!dest.exists());
        }
    }

    #[tokio::test]
    async fn test_stopped_transfer_makes_no_request() {
        let (base, requests) = serve(|_, _| ok(b"0123456789")).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("10144_hd.mp4");

        for (control, expected) in [
            (TransferControl::Pause, TransferOutcome::Paused),
            (TransferControl::Cancel, TransferOutcome::Cancelled),
        ] {
            let (outcome, _) = run(
                &transport(),
                request(format!("{}/10144_hd.mp4", base), dest.clone(), false),
                control,
            )
            .await;
            assert_eq!(outcome.unwrap(), expected);
        }
        assert!(requests.lock().unwrap().is_empty());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_segmented_stream_starts_with_init_section() {
        let (base, requests) = serve(|path, _| match path {
            "/hls/index.m3u8" => ok(b"#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\"\n\
                #EXTINF:6.0,\nseg0.m4s\n#EXTINF:6.0,\nseg1.m4s\n#EXT-X-ENDLIST\n"),
            "/hls/init.mp4" => ok(b"I"),
            "/hls/seg0.m4s" => ok(b"A"),
            "/hls/seg1.m4s" => ok(b"B"),
            _ => not_found(),
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("10144.mp4");

        let (outcome, progress) = run(
            &transport(),
            request(format!("{}/hls/index.m3u8", base), dest.clone(), true),
            TransferControl::Run,
        )
        .await;

        assert_eq!(outcome.unwrap(), TransferOutcome::Finished);
        assert_eq!(std::fs::read(&dest).unwrap(), b"IAB");
        assert_eq!(requests.lock().unwrap().len(), 4);
        assert_eq!(progress.last(), Some(&1.0));
    }
}
