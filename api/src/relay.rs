/// Relay client for the remote yt-dlp service.
///
/// Every job is one `GET {base}/stream?command=...` request whose SSE body is
/// decoded frame by frame. Nothing outlives the request: dropping a stream
/// returned here drops the upstream response and closes the connection.
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

use dlrelay_shared::errors::{RelayError, RelayResult};
use dlrelay_shared::models::{DownloadStatus, HelpText, ProgressEvent, SyncResult};
use dlrelay_shared::params::render_command;
use dlrelay_shared::sse::{is_completion_line, ProgressTracker, SseDecoder, SseFrame, SyncCollector};

use crate::config::Config;

/// Longest upstream line accepted before the stream is abandoned.
const MAX_LINE_BYTES: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Handle on the remote service. Cheap to clone.
#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    stream_url: Url,
    download_base_url: String,
    idle_timeout: Duration,
    sync_timeout: Duration,
}

impl RelayClient {
    pub fn new(base_url: &str, download_base_url: &str) -> anyhow::Result<Self> {
        let stream_url = Url::parse(&format!("{}/stream", base_url.trim_end_matches('/')))?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        info!(
            "Relay client initialized: stream_url={} download_base_url={}",
            stream_url, download_base_url
        );
        Ok(Self {
            http,
            stream_url,
            download_base_url: download_base_url.trim_end_matches('/').to_string(),
            idle_timeout: Duration::from_secs(crate::config::DEFAULT_DOWNLOAD_TIMEOUT),
            sync_timeout: Duration::from_secs(crate::config::DEFAULT_DOWNLOAD_TIMEOUT),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(&config.upstream_url, &config.download_base_url)?
            .with_idle_timeout(config.timeout())
            .with_sync_timeout(config.timeout()))
    }

    /// Longest wait for the upstream response headers and between two
    /// upstream lines.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Upper bound for [`RelayClient::download_sync`] and [`RelayClient::help`].
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Progress events for a job, in upstream order.
    ///
    /// The stream ends right after its first terminal event or error, and
    /// reports `StreamEnded` when the upstream closes before either.
    pub fn events(&self, params: &[String]) -> BoxStream<'static, RelayResult<ProgressEvent>> {
        let start = Phase::Connect {
            client: self.clone(),
            command: render_command(params),
        };
        stream::unfold(start, |phase| async move {
            let (mut frames, mut tracker) = match phase {
                Phase::Done => return None,
                Phase::Connect { client, command } => match client.open(&command).await {
                    Ok(frames) => (frames, ProgressTracker::new(client.download_base_url.clone())),
                    Err(e) => return Some((Err(e), Phase::Done)),
                },
                Phase::Relay { frames, tracker } => (frames, tracker),
            };

            loop {
                match frames.next_frame().await {
                    None => {
                        warn!("Upstream closed the stream without a terminal event");
                        return Some((Err(RelayError::StreamEnded), Phase::Done));
                    }
                    Some(Err(e)) => return Some((Err(e), Phase::Done)),
                    Some(Ok(frame)) => {
                        if let Some(event) = tracker.observe(&frame) {
                            let next = if event.is_terminal() {
                                Phase::Done
                            } else {
                                Phase::Relay { frames, tracker }
                            };
                            return Some((Ok(event), next));
                        }
                    }
                }
            }
        })
        .boxed()
    }

    /// Streaming mode: like [`RelayClient::events`] with errors folded into a
    /// final `failed` event, so the last item is always terminal.
    pub fn stream(&self, params: &[String]) -> BoxStream<'static, ProgressEvent> {
        self.events(params)
            .map(|item| match item {
                Ok(event) => event,
                Err(e) => {
                    warn!("Relay stream failed: {}", e);
                    ProgressEvent::failed(e.to_string())
                }
            })
            .boxed()
    }

    /// Synchronous mode: wait for the job to finish, up to the sync timeout.
    ///
    /// On timeout the upstream job is abandoned, not cancelled.
    pub async fn download_sync(&self, params: &[String]) -> RelayResult<SyncResult> {
        let mut events = self.events(params);
        self.within_sync_timeout(async move {
            let mut collector = SyncCollector::new();
            while let Some(event) = events.next().await {
                let event = event?;
                match event.status {
                    DownloadStatus::Completed => {
                        let result = collector.finish(&event);
                        info!(
                            "Sync download completed: download_url={}",
                            result.download_url.as_deref().unwrap_or("missing")
                        );
                        return Ok(result);
                    }
                    DownloadStatus::Failed => return Err(RelayError::JobFailed(event.message)),
                    _ => collector.push(&event),
                }
            }
            Err(RelayError::StreamEnded)
        })
        .await
    }

    /// Fetch `yt-dlp --help` through the remote service.
    pub async fn help(&self) -> RelayResult<HelpText> {
        let command = render_command(&["--help".to_string()]);
        let help = self
            .within_sync_timeout(async {
                let mut frames = self.open(&command).await?;
                let mut lines: Vec<String> = Vec::new();
                while let Some(frame) = frames.next_frame().await {
                    let frame = frame?;
                    match frame.event_type() {
                        "close" => break,
                        "error" => return Err(RelayError::JobFailed(frame.data)),
                        _ if is_completion_line(&frame.data) => break,
                        _ => lines.push(frame.data.trim_end().to_string()),
                    }
                }
                Ok(lines.join("\n"))
            })
            .await?;
        info!("Help text retrieved: {} lines", help.lines().count());
        Ok(HelpText { command, help })
    }

    async fn within_sync_timeout<T>(
        &self,
        fut: impl Future<Output = RelayResult<T>>,
    ) -> RelayResult<T> {
        let started = Instant::now();
        match tokio::time::timeout(self.sync_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = started.elapsed();
                warn!("Giving up on upstream job after {:.1}s", elapsed.as_secs_f64());
                Err(RelayError::Timeout { elapsed })
            }
        }
    }

    /// Submit `command` and return a reader over the upstream event stream.
    async fn open(&self, command: &str) -> RelayResult<FrameReader> {
        let mut url = self.stream_url.clone();
        url.query_pairs_mut().append_pair("command", command);
        info!("Submitting upstream command: {}", command);

        let request = self.http.get(url).header(ACCEPT, "text/event-stream").send();
        let resp = match tokio::time::timeout(self.idle_timeout, request).await {
            Ok(resp) => resp.map_err(|e| RelayError::Unreachable(e.to_string()))?,
            Err(_) => {
                warn!("Upstream sent no response headers within {:?}", self.idle_timeout);
                return Err(RelayError::Timeout { elapsed: self.idle_timeout });
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("Upstream returned HTTP {}: {:.200}", status, body);
            return Err(RelayError::UpstreamStatus {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        debug!("Upstream stream established: status={}", status);

        let body = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_LINE_BYTES);
        let lines = FramedRead::new(StreamReader::new(body), codec)
            .map_ok(|chunk| match String::from_utf8(chunk.to_vec()) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Upstream sent invalid UTF-8, decoding lossily");
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            })
            .boxed();

        Ok(FrameReader {
            lines,
            decoder: SseDecoder::new(),
            idle_timeout: self.idle_timeout,
            finished: false,
        })
    }
}

enum Phase {
    Connect { client: RelayClient, command: String },
    Relay { frames: FrameReader, tracker: ProgressTracker },
    Done,
}

/// Upstream body split into SSE frames.
struct FrameReader {
    lines: BoxStream<'static, Result<String, AnyDelimiterCodecError>>,
    decoder: SseDecoder,
    idle_timeout: Duration,
    finished: bool,
}

impl FrameReader {
    /// Next complete frame; `None` once the upstream body has ended.
    async fn next_frame(&mut self) -> Option<RelayResult<SseFrame>> {
        if self.finished {
            return None;
        }
        loop {
            let line = match tokio::time::timeout(self.idle_timeout, self.lines.next()).await {
                Err(_) => {
                    self.finished = true;
                    warn!("No upstream activity for {}s", self.idle_timeout.as_secs());
                    return Some(Err(RelayError::Timeout { elapsed: self.idle_timeout }));
                }
                Ok(None) => {
                    self.finished = true;
                    return self.decoder.finish().map(Ok);
                }
                Ok(Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded))) => {
                    warn!("Skipping upstream line longer than {} bytes", MAX_LINE_BYTES);
                    continue;
                }
                Ok(Some(Err(AnyDelimiterCodecError::Io(e)))) => {
                    self.finished = true;
                    return Some(Err(RelayError::Unreachable(format!("upstream read failed: {}", e))));
                }
                Ok(Some(Ok(line))) => line,
            };
            if let Some(frame) = self.decoder.push_line(&line) {
                return Some(Ok(frame));
            }
        }
    }
}
