/// Per-stream logging for relayed SSE connections.
use chrono::{DateTime, Utc};
use dlrelay_shared::models::{DownloadStatus, ProgressEvent};
use tracing::{debug, info, warn};

/// Tracks one downstream SSE stream from open to close.
///
/// A stream dropped before a terminal event was relayed is logged as closed
/// by the client.
pub struct StreamLog {
    id: String,
    kind: &'static str,
    started_at: DateTime<Utc>,
    events_sent: u64,
    outcome: Option<DownloadStatus>,
}

impl StreamLog {
    pub fn start(kind: &'static str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        info!("SSE stream started: id={} kind={}", id, kind);
        Self {
            id,
            kind,
            started_at: Utc::now(),
            events_sent: 0,
            outcome: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record one relayed event.
    pub fn event(&mut self, event: &ProgressEvent) {
        self.events_sent += 1;
        debug!(
            "SSE [{}] event {}: status={} message={:.100}",
            self.id, self.events_sent, event.status, event.message
        );
        if event.is_terminal() {
            self.outcome = Some(event.status);
        }
    }

    fn elapsed_secs(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

impl Drop for StreamLog {
    fn drop(&mut self) {
        match self.outcome {
            Some(DownloadStatus::Completed) => info!(
                "SSE stream [{}] ({}) completed: events={} duration={:.3}s",
                self.id, self.kind, self.events_sent, self.elapsed_secs()
            ),
            Some(status) => warn!(
                "SSE stream [{}] ({}) ended with status {}: events={} duration={:.3}s",
                self.id, self.kind, status, self.events_sent, self.elapsed_secs()
            ),
            None => info!(
                "SSE stream [{}] ({}) closed by client: events={} duration={:.3}s",
                self.id, self.kind, self.events_sent, self.elapsed_secs()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_events_and_records_outcome() {
        let mut log = StreamLog::start("download");
        assert_eq!(log.id().len(), 8);

        log.event(&ProgressEvent::new(DownloadStatus::Downloading, "[download] 10.0% of 1MiB"));
        assert_eq!(log.outcome, None);
        log.event(&ProgressEvent::new(DownloadStatus::Completed, "done"));
        assert_eq!(log.events_sent, 2);
        assert_eq!(log.outcome, Some(DownloadStatus::Completed));
    }
}
