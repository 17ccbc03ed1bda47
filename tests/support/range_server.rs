//! A wiremock responder that serves a fixed body and honours `Range`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use wiremock::{Request, Respond, ResponseTemplate};

#[derive(Clone)]
pub struct RangeServer {
    body: Arc<Vec<u8>>,
    honour_ranges: bool,
    max_segment: Option<usize>,
    stalled_requests: usize,
    stall: Duration,
    hits: Arc<AtomicUsize>,
}

impl RangeServer {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Arc::new(body.into()),
            honour_ranges: true,
            max_segment: None,
            stalled_requests: 0,
            stall: Duration::ZERO,
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answers every request with the full body and status 200.
    pub fn ignoring_ranges(mut self) -> Self {
        self.honour_ranges = false;
        self
    }

    /// Caps each 206 body at `max` bytes, like a server cutting responses short.
    pub fn with_max_segment(mut self, max: usize) -> Self {
        self.max_segment = Some(max);
        self
    }

    /// Delays the first `count` responses by `stall`.
    pub fn stalling_first(mut self, count: usize, stall: Duration) -> Self {
        self.stalled_requests = count;
        self.stall = stall;
        self
    }

    pub fn hits(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.hits)
    }

    fn template(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) if self.honour_ranges => {
                if start >= total {
                    return ResponseTemplate::new(416)
                        .insert_header("Content-Range", format!("bytes */{total}"));
                }
                let mut last = end.unwrap_or(total - 1).min(total - 1);
                if let Some(max) = self.max_segment {
                    last = last.min(start + max - 1);
                }
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {start}-{last}/{total}"))
                    .set_body_bytes(self.body[start..=last].to_vec())
            }
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.to_vec()),
        }
    }
}

impl Respond for RangeServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let hit = self.hits.fetch_add(1, Ordering::SeqCst);
        let template = self.template(request);
        if hit < self.stalled_requests {
            template.set_delay(self.stall)
        } else {
            template
        }
    }
}

fn parse_range(value: &str) -> Option<(usize, Option<usize>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}
