//! wiremock responders mimicking the platform's resumable upload session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SESSION_PATH: &str = "/sessions/s1";

/// Shared view of what the mock session holds.
#[derive(Clone, Default)]
pub struct SessionState {
    pub offset: Arc<AtomicU64>,
    pub patches: Arc<AtomicUsize>,
}

impl SessionState {
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }
}

/// Accepts chunks at the current offset and completes once `total` is reached.
pub struct ChunkResponder {
    state: SessionState,
    total: u64,
    completion: Value,
    stalled_patches: usize,
    stall: Duration,
}

impl ChunkResponder {
    pub fn new(state: SessionState, total: u64, completion: Value) -> Self {
        Self {
            state,
            total,
            completion,
            stalled_patches: 0,
            stall: Duration::ZERO,
        }
    }

    /// Stores the first `count` chunks but answers them only after `stall`.
    pub fn stalling_first(mut self, count: usize, stall: Duration) -> Self {
        self.stalled_patches = count;
        self.stall = stall;
        self
    }
}

impl Respond for ChunkResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let hit = self.state.patches.fetch_add(1, Ordering::SeqCst);
        let offset: u64 = request
            .headers
            .get("upload-offset")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(u64::MAX);
        if offset != self.state.offset() {
            return ResponseTemplate::new(409);
        }

        let confirmed = offset + request.body.len() as u64;
        self.state.offset.store(confirmed, Ordering::SeqCst);
        let template = if confirmed >= self.total {
            ResponseTemplate::new(200).set_body_json(self.completion.clone())
        } else {
            ResponseTemplate::new(204).insert_header("Upload-Offset", confirmed.to_string())
        };
        if hit < self.stalled_patches {
            template.set_delay(self.stall)
        } else {
            template
        }
    }
}

/// Reports the session offset, or nothing once the upload completed.
pub struct OffsetResponder {
    state: SessionState,
    total: u64,
}

impl Respond for OffsetResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let offset = self.state.offset();
        if offset >= self.total && self.total > 0 {
            ResponseTemplate::new(200)
        } else {
            ResponseTemplate::new(200).insert_header("Upload-Offset", offset.to_string())
        }
    }
}

/// Mounts session creation and HEAD handlers; PATCH is left to the test.
pub async fn mount_session(server: &MockServer, state: &SessionState, total: u64) {
    Mock::given(method("POST"))
        .and(path("/api/v1/upload/upload_resumable"))
        .respond_with(ResponseTemplate::new(201).insert_header("Location", SESSION_PATH))
        .mount(server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(SESSION_PATH))
        .respond_with(OffsetResponder {
            state: state.clone(),
            total,
        })
        .mount(server)
        .await;
}
