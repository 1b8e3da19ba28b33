/// In-process stand-in for the remote service, used by relay and route tests.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{stream, StreamExt};

#[derive(Debug, Clone)]
enum Step {
    Chunk(String),
    Sleep(Duration),
}

/// What the mock sends back for every `/stream` request.
#[derive(Debug, Clone)]
pub struct Script {
    status: u16,
    pace: Option<Duration>,
    steps: Vec<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self {
            status: 200,
            pace: None,
            steps: Vec::new(),
        }
    }

    pub fn successful_job() -> Self {
        Self::new()
            .data("[youtube] Extracting URL: https://example.com/v")
            .data("[download]  25.0% of 4.24MiB at 1.00MiB/s ETA 00:03")
            .data("[download]  75.0% of 4.24MiB at 1.00MiB/s ETA 00:01")
            .data(r#"<a href="/download/clip%20one.mp4" target="_blank">Download File</a>"#)
            .data(dlrelay_shared::sse::COMPLETION_MARKER)
            .close()
    }

    pub fn failing_job() -> Self {
        Self::new()
            .data("[youtube] Extracting URL: https://example.com/v")
            .data("ERROR: [youtube] abc: Video unavailable")
            .data("never relayed")
            .close()
    }

    pub fn data(mut self, text: &str) -> Self {
        self.steps.push(Step::Chunk(format!("data: {}\n\n", text)));
        self
    }

    pub fn close(mut self) -> Self {
        self.steps.push(Step::Chunk("event: close\n\n".to_string()));
        self
    }

    pub fn pause(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Sleep(duration));
        self
    }

    /// Delay before every chunk.
    pub fn pace(mut self, duration: Duration) -> Self {
        self.pace = Some(duration);
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

struct MockState {
    script: Script,
    commands: Mutex<Vec<String>>,
    bodies_dropped: AtomicUsize,
}

/// Counts a response body as dropped when the server releases it.
struct BodyGuard(Arc<MockState>);

impl Drop for BodyGuard {
    fn drop(&mut self) {
        self.0.bodies_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Running mock server bound to an ephemeral local port.
pub struct MockUpstream {
    addr: std::net::SocketAddr,
    state: Arc<MockState>,
}

impl MockUpstream {
    pub async fn start(script: Script) -> Self {
        let state = Arc::new(MockState {
            script,
            commands: Mutex::new(Vec::new()),
            bodies_dropped: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/stream", get(stream_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Commands received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Response bodies released by the server, finished or not.
    pub fn bodies_dropped(&self) -> usize {
        self.state.bodies_dropped.load(Ordering::SeqCst)
    }
}

async fn stream_handler(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state
        .commands
        .lock()
        .unwrap()
        .push(query.get("command").cloned().unwrap_or_default());

    let status = StatusCode::from_u16(state.script.status).unwrap();
    if !status.is_success() {
        return (status, "upstream unavailable").into_response();
    }

    let pace = state.script.pace;
    let guard = BodyGuard(state.clone());
    let body = stream::iter(state.script.steps.clone())
        .then(move |step| async move {
            match step {
                Step::Chunk(chunk) => {
                    if let Some(delay) = pace {
                        tokio::time::sleep(delay).await;
                    }
                    Some(chunk)
                }
                Step::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    None
                }
            }
        })
        .filter_map(|chunk| async move { chunk.map(Ok::<_, Infallible>) })
        .map(move |chunk| {
            let _guard = &guard;
            chunk
        });

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}
