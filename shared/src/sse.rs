/// Upstream event-stream protocol.
///
/// The remote service answers `/stream` with Server-Sent Events whose data
/// lines carry raw yt-dlp console output. [`SseDecoder`] assembles lines into
/// frames and [`ProgressTracker`] turns frames into [`ProgressEvent`]s.
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::models::{DownloadStatus, ProgressEvent, SyncResult};

/// Marker the remote service prints once the command has finished.
pub const COMPLETION_MARKER: &str = "Command execution completed";

// ====== FRAME DECODING ======

/// One dispatched upstream event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    /// Event type, `message` when the frame did not name one.
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Line-oriented SSE frame assembler.
///
/// Feed it lines without their terminators; a blank line dispatches the
/// pending frame.
#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one line. Returns a frame when the line completes one.
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => {}
            other => debug!("Ignoring unknown SSE field: {}", other),
        }
        None
    }

    /// Flush whatever is pending when the upstream closes without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.event.is_none() {
            self.id = None;
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(frame)
    }
}

// ====== YT-DLP OUTPUT ======

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[download\]\s+(\d+(?:\.\d+)?)%\s+of\s+~?\s*\S+(?:\s+at\s+(\S+))?(?:\s+ETA\s+(\S+))?"
    ).unwrap()
});

/// Relative download link as emitted by the remote service.
static RELATIVE_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"href="(/download/[^"]+)""#).unwrap()
});

static ABSOLUTE_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"href="(https?://[^"]+/download/[^"]+)""#).unwrap()
});

/// Parsed `[download]  42.0% of 4.24MiB at 1.20MiB/s ETA 00:04` line.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadLine {
    pub percent: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

/// Parse the last yt-dlp progress line contained in `text`.
pub fn parse_download_line(text: &str) -> Option<DownloadLine> {
    let caps = PROGRESS_RE.captures_iter(text).last()?;
    let percent = caps.get(1)?.as_str().parse::<f64>().ok()?.clamp(0.0, 100.0);
    Some(DownloadLine {
        percent,
        speed: caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.starts_with("Unknown")),
        eta: caps
            .get(3)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.starts_with("Unknown")),
    })
}

/// Whether a line reports that the command failed.
///
/// Tagged yt-dlp output (`[download] Destination: ...`, `[Merger] ...`),
/// download links and file housekeeping lines carry titles, so only an
/// `ERROR` prefix counts there.
pub fn is_failure_line(text: &str) -> bool {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("error") {
        return true;
    }
    if lower.starts_with("warning") || lower.contains("retrying") || carries_file_name(trimmed) {
        return false;
    }
    lower.contains("error:") || lower.contains("failed")
}

fn carries_file_name(line: &str) -> bool {
    line.starts_with('[') || line.contains("href=") || line.starts_with("Deleting original file")
}

pub fn is_completion_line(text: &str) -> bool {
    text.contains(COMPLETION_MARKER)
}

/// Rewrite relative `/download/...` links onto `base_url`.
pub fn absolutize_download_links(text: &str, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    RELATIVE_LINK_RE
        .replace_all(text, |caps: &regex::Captures| {
            format!("href=\"{}{}\"", base, &caps[1])
        })
        .into_owned()
}

/// First absolute download link in `text`.
pub fn extract_download_url(text: &str) -> Option<String> {
    ABSOLUTE_LINK_RE
        .captures(text)
        .map(|caps| caps[1].to_string())
}

/// Decoded file name from a `.../download/<name>` link.
pub fn filename_from_download_url(download_url: &str) -> Option<String> {
    let parsed = Url::parse(download_url).ok()?;
    let (_, encoded) = parsed.path().split_once("/download/")?;
    if encoded.is_empty() {
        return None;
    }
    Some(percent_decode_str(encoded).decode_utf8_lossy().into_owned())
}

// ====== PROGRESS TRACKING ======

/// Classifies upstream frames of one job into progress events.
///
/// Percent never decreases across events, and status never returns to
/// `queued` once a download line was seen.
#[derive(Debug)]
pub struct ProgressTracker {
    download_base_url: String,
    status: DownloadStatus,
    percent: Option<f64>,
}

impl ProgressTracker {
    pub fn new(download_base_url: impl Into<String>) -> Self {
        Self {
            download_base_url: download_base_url.into(),
            status: DownloadStatus::Queued,
            percent: None,
        }
    }

    /// Classify one frame. Returns `None` for frames carrying nothing to relay.
    pub fn observe(&mut self, frame: &SseFrame) -> Option<ProgressEvent> {
        match frame.event_type() {
            "close" => {
                let event = if self.status == DownloadStatus::Failed {
                    ProgressEvent::failed("Download failed")
                } else {
                    self.event(DownloadStatus::Completed, "Download completed")
                };
                return Some(self.record(event));
            }
            "error" => {
                let message = if frame.data.trim().is_empty() {
                    "Upstream reported an error".to_string()
                } else {
                    frame.data.clone()
                };
                return Some(self.record(ProgressEvent::failed(message)));
            }
            _ => {}
        }

        if frame.data.trim().is_empty() {
            debug!("Skipping upstream frame without data (event={})", frame.event_type());
            return None;
        }

        let data = absolutize_download_links(&frame.data, &self.download_base_url);
        let link = extract_download_url(&data);

        let mut event = if is_completion_line(&data) {
            self.percent = Some(100.0);
            self.event(DownloadStatus::Completed, data)
        } else if is_failure_line(&data) {
            ProgressEvent::failed(data)
        } else if let Some(line) = parse_download_line(&data) {
            self.percent = Some(self.percent.map_or(line.percent, |p| p.max(line.percent)));
            let mut event = self.event(DownloadStatus::Downloading, data);
            event.speed = line.speed;
            event.eta = line.eta;
            event
        } else if data.trim_start().starts_with("[download]") {
            self.event(DownloadStatus::Downloading, data)
        } else {
            self.event(self.status, data)
        };
        event.download_url = link;

        Some(self.record(event))
    }

    fn event(&self, status: DownloadStatus, message: impl Into<String>) -> ProgressEvent {
        let mut event = ProgressEvent::new(status, message);
        if status != DownloadStatus::Queued {
            event.percent = self.percent;
        }
        event
    }

    fn record(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.status = event.status;
        event
    }
}

/// Folds a relayed event sequence into a [`SyncResult`].
#[derive(Debug, Default)]
pub struct SyncCollector {
    download_url: Option<String>,
    last_progress: Option<ProgressEvent>,
}

impl SyncCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &ProgressEvent) {
        if self.download_url.is_none() {
            self.download_url = event.download_url.clone();
        }
        if event.percent.is_some() {
            self.last_progress = Some(event.clone());
        }
    }

    /// Build the result once `terminal` ended the job.
    pub fn finish(mut self, terminal: &ProgressEvent) -> SyncResult {
        self.push(terminal);
        let message = match terminal.status {
            DownloadStatus::Completed => "Download completed successfully".to_string(),
            _ => terminal.message.clone(),
        };
        let filename = self
            .download_url
            .as_deref()
            .and_then(filename_from_download_url);
        let progress = self.last_progress.map(|mut p| {
            p.status = terminal.status;
            p
        });
        SyncResult {
            status: terminal.status,
            download_url: self.download_url,
            filename,
            message,
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(text: &str) -> SseFrame {
        SseFrame { data: text.to_string(), ..Default::default() }
    }

    fn decode_all(lines: &[&str]) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::new();
        let mut frames: Vec<SseFrame> = lines.iter().filter_map(|l| decoder.push_line(l)).collect();
        frames.extend(decoder.finish());
        frames
    }

    #[test]
    fn test_decoder_dispatches_on_blank_line() {
        let frames = decode_all(&["data: hello", "", "event: close", "data: bye", "id: 7", ""]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "hello");
        assert_eq!(frames[0].event_type(), "message");
        assert_eq!(frames[1].event.as_deref(), Some("close"));
        assert_eq!(frames[1].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_decoder_joins_multiline_data_and_skips_comments() {
        let frames = decode_all(&[": keep-alive", "data: one", "data:two\r", "", "", "retry: 100"]);
        assert_eq!(frames, vec![data("one\ntwo")]);
    }

    #[test]
    fn test_decoder_flushes_pending_frame() {
        let frames = decode_all(&["data: tail"]);
        assert_eq!(frames, vec![data("tail")]);
    }

    #[test]
    fn test_parse_download_line() {
        let line = parse_download_line("[download]  42.5% of   4.24MiB at  500.00KiB/s ETA 00:04").unwrap();
        assert_eq!(line.percent, 42.5);
        assert_eq!(line.speed.as_deref(), Some("500.00KiB/s"));
        assert_eq!(line.eta.as_deref(), Some("00:04"));

        let done = parse_download_line("[download] 100% of 4.24MiB in 00:00:03 at 1.2MiB/s").unwrap();
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.speed, None);

        let unknown = parse_download_line("[download]   0.0% of ~  10.00MiB at  Unknown B/s ETA Unknown").unwrap();
        assert_eq!(unknown.speed, None);
        assert_eq!(unknown.eta, None);

        assert!(parse_download_line("[download] Destination: video.mp4").is_none());
    }

    #[test]
    fn test_failure_lines() {
        assert!(is_failure_line("ERROR: [youtube] abc: Video unavailable"));
        assert!(is_failure_line("Command execution failed with code 1"));
        assert!(!is_failure_line("WARNING: unable to extract uploader, failed once"));
        assert!(!is_failure_line("[download] Got error: timed out. Retrying (1/10)..."));
        assert!(!is_failure_line("[info] Writing video metadata"));
        assert!(!is_failure_line("[download] Destination: Why My Startup Failed.mp4"));
        assert!(!is_failure_line(r#"[Merger] Merging formats into "Failed Again: error: none.mp4""#));
        assert!(!is_failure_line("Deleting original file Failed.f137.mp4 (pass -k to keep)"));
    }

    #[test]
    fn test_title_mentioning_failure_does_not_end_job() {
        let mut tracker = ProgressTracker::new("https://ytdlp.online");
        let e = tracker.observe(&data("[download] Destination: Why My Startup Failed.mp4")).unwrap();
        assert_eq!(e.status, DownloadStatus::Downloading);
        assert!(!e.is_terminal());

        let e = tracker.observe(&data("[download]  50.0% of 4.24MiB at 1.00MiB/s ETA 00:02")).unwrap();
        assert_eq!(e.status, DownloadStatus::Downloading);

        let e = tracker
            .observe(&data(r#"<a href="/download/Why%20My%20Startup%20Failed.mp4" target="_blank">Download File</a>"#))
            .unwrap();
        assert_eq!(e.status, DownloadStatus::Downloading);

        let e = tracker.observe(&data(COMPLETION_MARKER)).unwrap();
        assert_eq!(e.status, DownloadStatus::Completed);
    }

    #[test]
    fn test_download_links() {
        let text = r#"<a href="/download/my%20video.mp4" target="_blank">Download File</a>"#;
        let rewritten = absolutize_download_links(text, "https://cdn.example.com/");
        assert_eq!(
            rewritten,
            r#"<a href="https://cdn.example.com/download/my%20video.mp4" target="_blank">Download File</a>"#
        );
        let url = extract_download_url(&rewritten).unwrap();
        assert_eq!(url, "https://cdn.example.com/download/my%20video.mp4");
        assert_eq!(filename_from_download_url(&url).as_deref(), Some("my video.mp4"));
        assert_eq!(filename_from_download_url("https://cdn.example.com/download/"), None);
    }

    #[test]
    fn test_tracker_lifecycle() {
        let mut tracker = ProgressTracker::new("https://ytdlp.online");

        let e = tracker.observe(&data("[youtube] Extracting URL")).unwrap();
        assert_eq!(e.status, DownloadStatus::Queued);
        assert_eq!(e.percent, None);

        let e = tracker.observe(&data("[download]  60.0% of 4.24MiB at 1.00MiB/s ETA 00:02")).unwrap();
        assert_eq!(e.status, DownloadStatus::Downloading);
        assert_eq!(e.percent, Some(60.0));

        // second stream (audio) restarts at 0%, percent must not go back
        let e = tracker.observe(&data("[download]   5.0% of 1.00MiB at 1.00MiB/s ETA 00:01")).unwrap();
        assert_eq!(e.percent, Some(60.0));

        let e = tracker.observe(&data("[Merger] Merging formats")).unwrap();
        assert_eq!(e.status, DownloadStatus::Downloading);

        assert!(tracker.observe(&data("   ")).is_none());

        let e = tracker
            .observe(&data(r#"<a href="/download/clip.mp4" target="_blank">Download File</a>"#))
            .unwrap();
        assert_eq!(e.download_url.as_deref(), Some("https://ytdlp.online/download/clip.mp4"));

        let e = tracker.observe(&data(COMPLETION_MARKER)).unwrap();
        assert_eq!(e.status, DownloadStatus::Completed);
        assert_eq!(e.percent, Some(100.0));
    }

    #[test]
    fn test_sync_collector() {
        let mut tracker = ProgressTracker::new("https://ytdlp.online");
        let mut collector = SyncCollector::new();
        for line in [
            "[download]  50.0% of 4.24MiB at 1.00MiB/s ETA 00:02",
            r#"<a href="/download/my%20clip.mp4" target="_blank">Download File</a>"#,
        ] {
            collector.push(&tracker.observe(&data(line)).unwrap());
        }
        let terminal = tracker.observe(&data(COMPLETION_MARKER)).unwrap();
        let result = collector.finish(&terminal);
        assert_eq!(result.status, DownloadStatus::Completed);
        assert_eq!(result.download_url.as_deref(), Some("https://ytdlp.online/download/my%20clip.mp4"));
        assert_eq!(result.filename.as_deref(), Some("my clip.mp4"));
        assert_eq!(result.message, "Download completed successfully");
        let progress = result.progress.unwrap();
        assert_eq!(progress.status, DownloadStatus::Completed);
        assert_eq!(progress.percent, Some(100.0));
    }

    #[test]
    fn test_tracker_close_and_error_events() {
        let mut tracker = ProgressTracker::new("https://ytdlp.online");
        let close = SseFrame { event: Some("close".into()), ..Default::default() };
        assert_eq!(tracker.observe(&close).unwrap().status, DownloadStatus::Completed);

        let mut tracker = ProgressTracker::new("https://ytdlp.online");
        let err = SseFrame { event: Some("error".into()), ..Default::default() };
        let e = tracker.observe(&err).unwrap();
        assert_eq!(e.status, DownloadStatus::Failed);
        assert_eq!(e.message, "Upstream reported an error");
    }

    #[test]
    fn test_tracker_failure_line() {
        let mut tracker = ProgressTracker::new("https://ytdlp.online");
        let e = tracker.observe(&data("ERROR: Unsupported URL: https://example.com")).unwrap();
        assert!(e.is_terminal());
        assert_eq!(e.status, DownloadStatus::Failed);
        assert_eq!(tracker.status, DownloadStatus::Failed);
    }
}
