/// Request and progress models shared by the translator and the relay.
use serde::{Deserialize, Serialize};

/// Download request with friendly options.
///
/// Arrives as query parameters, so every field has a default and a missing
/// `url` is caught by validation rather than by deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    /// Video format (e.g. best, worst, mp4, webm)
    pub format: Option<String>,
    /// Quality selection (e.g. best, 1080p, 720p)
    pub quality: Option<String>,
    #[serde(default)]
    pub audio_only: bool,
    /// Audio format (e.g. mp3, aac, m4a)
    pub audio_format: Option<String>,
    #[serde(default)]
    pub playlist: bool,
    /// Specific playlist items (e.g. 1-5,8,10-12)
    pub playlist_items: Option<String>,
    /// Custom output filename template
    pub output_template: Option<String>,
    #[serde(default)]
    pub subtitles: bool,
    /// Subtitle language code (e.g. en, es)
    pub subtitle_lang: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Download request carrying raw yt-dlp parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomDownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Download status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[serde(alias = "pending")]
    Queued,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    /// Completed and failed end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One update in the download-status stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub status: DownloadStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl ProgressEvent {
    pub fn new(status: DownloadStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            percent: None,
            speed: None,
            eta: None,
            download_url: None,
        }
    }

    /// Terminal failure event.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(DownloadStatus::Failed, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Terminal outcome of a synchronous download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncResult {
    pub status: DownloadStatus,
    pub download_url: Option<String>,
    pub filename: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressEvent>,
}

/// yt-dlp help text fetched through the remote service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelpText {
    pub command: String,
    pub help: String,
}
