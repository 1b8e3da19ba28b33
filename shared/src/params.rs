/// Translation of friendly download options into yt-dlp arguments.
///
/// Everything here is pure: the output only depends on the request, and a
/// field left at its default never produces a token.
use tracing::{debug, warn};

use crate::errors::{RelayError, RelayResult};
use crate::models::{CustomDownloadRequest, DownloadRequest};

/// Executable name prepended to every upstream command.
pub const YTDLP_BIN: &str = "yt-dlp";

/// Build the yt-dlp argument list for a friendly download request.
///
/// The URL is always the final token.
pub fn build_params(req: &DownloadRequest) -> RelayResult<Vec<String>> {
    let url = require_url(&req.url)?;
    let mut params: Vec<String> = Vec::new();

    // Format selection
    if req.audio_only {
        params.push("--extract-audio".to_string());
        if let Some(audio_format) = non_blank(&req.audio_format) {
            params.push("--audio-format".to_string());
            params.push(audio_format.to_string());
        }
    } else if let Some(selector) = non_blank(&req.quality).and_then(quality_selector) {
        params.push("-f".to_string());
        params.push(selector);
    } else if let Some(format) = non_blank(&req.format) {
        params.push("-f".to_string());
        params.push(format.to_string());
    }

    // Playlist
    if req.playlist {
        params.push("--yes-playlist".to_string());
    }
    if let Some(items) = non_blank(&req.playlist_items) {
        params.push("--playlist-items".to_string());
        params.push(normalize_playlist_items(items));
    }

    // Subtitles
    if req.subtitles {
        params.push("--write-subs".to_string());
        if let Some(lang) = non_blank(&req.subtitle_lang) {
            params.push("--sub-lang".to_string());
            params.push(lang.to_string());
        }
    }

    if let Some(template) = non_blank(&req.output_template) {
        params.push("-o".to_string());
        params.push(template.to_string());
    }

    params.push(url.to_string());
    debug!("Translated request for {} into {} tokens", url, params.len());
    Ok(params)
}

/// Argument list for a raw-parameter request. Tokens pass through untouched.
pub fn custom_params(req: &CustomDownloadRequest) -> RelayResult<Vec<String>> {
    let url = require_url(&req.url)?;
    let mut params = req.params.clone();
    params.push(url.to_string());
    Ok(params)
}

/// Render an argument list as the command line the remote service runs.
pub fn render_command(params: &[String]) -> String {
    let mut command = String::from(YTDLP_BIN);
    for token in params {
        command.push(' ');
        command.push_str(&quote_token(token));
    }
    command
}

/// Map a quality label to a yt-dlp format selector.
///
/// Returns `None` for labels yt-dlp has no direct selector for.
pub fn quality_selector(quality: &str) -> Option<String> {
    let quality = quality.trim().to_ascii_lowercase();
    if quality == "best" {
        return Some("bestvideo+bestaudio/best".to_string());
    }
    let height: u32 = quality.strip_suffix('p')?.parse().ok()?;
    if height == 0 {
        return None;
    }
    Some(format!(
        "bestvideo[height<={h}]+bestaudio/best[height<={h}]",
        h = height
    ))
}

fn require_url(url: &str) -> RelayResult<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(RelayError::Validation("url is required".to_string()));
    }
    Ok(url)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn quote_token(token: &str) -> String {
    let needs_quotes = token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '"');
    if !needs_quotes {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

fn normalize_playlist_items(raw: &str) -> String {
    match PlaylistItems::parse(raw) {
        Some(items) => items.to_string(),
        None => {
            warn!("Passing playlist_items through unparsed: {}", raw);
            raw.to_string()
        }
    }
}

// ====== PLAYLIST RANGES ======

/// One range of 1-based playlist indices. `end == None` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ItemRange {
    start: u32,
    end: Option<u32>,
}

impl ItemRange {
    fn contains_or_touches(&self, next: &ItemRange) -> bool {
        match self.end {
            None => true,
            Some(end) => next.start <= end.saturating_add(1),
        }
    }
}

/// Parsed `playlist_items` selection, stored as the sorted union of its ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistItems {
    ranges: Vec<ItemRange>,
}

impl PlaylistItems {
    /// Parse `"1-5,8,10-"`-style lists. Overlapping and adjacent ranges are
    /// merged, so `"1-5,3-8"` selects 1 through 8.
    ///
    /// Returns `None` for anything outside that grammar (slices, negative
    /// indices, reversed ranges).
    pub fn parse(raw: &str) -> Option<Self> {
        let mut ranges = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let range = match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_index(start)?;
                    let end = if end.trim().is_empty() {
                        None
                    } else {
                        Some(parse_index(end)?)
                    };
                    if matches!(end, Some(end) if end < start) {
                        return None;
                    }
                    ItemRange { start, end }
                }
                None => {
                    let index = parse_index(part)?;
                    ItemRange { start: index, end: Some(index) }
                }
            };
            ranges.push(range);
        }
        if ranges.is_empty() {
            return None;
        }

        ranges.sort_by_key(|r| r.start);
        let mut merged: Vec<ItemRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.contains_or_touches(&range) => {
                    last.end = match (last.end, range.end) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        _ => None,
                    };
                }
                _ => merged.push(range),
            }
        }
        Some(Self { ranges: merged })
    }

}

impl std::fmt::Display for PlaylistItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match range.end {
                Some(end) if end == range.start => write!(f, "{}", range.start)?,
                Some(end) => write!(f, "{}-{}", range.start, end)?,
                None => write!(f, "{}-", range.start)?,
            }
        }
        Ok(())
    }
}

fn parse_index(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u32>().ok().filter(|&i| i > 0)
}
