//! Bulk traffic endpoints for the single-user test.
//!
//! `/download` streams exactly N bytes of freshly-generated random
//! payload in transport-sized chunks; `/upload` drains and counts. Per
//! request memory stays O(chunk): nothing is pre-allocated beyond the
//! chunk in flight and no payload byte is retained.
//!
//! Streams tagged with a `test_id` are admitted through the orchestrator
//! (rejected during baseline, registered for teardown otherwise) and
//! deregister on any exit path via the guard's drop — including client
//! disconnect, which drops the response future.
//!
//! With `Accept: text/event-stream` both endpoints switch to an SSE
//! response carrying a `progress` event every 250 ms; downloads wrap
//! their payload in base64 `chunk` events (the source stays random, so
//! the body stays uncompressible), uploads finish with a summary event.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use serde::Deserialize;

use bloatmark_common::model::StreamKind;

use crate::error::ApiError;
use crate::orchestrator::{self, StreamGuard};
use crate::state::AppState;

/// Transport chunk size. Big enough to saturate, small enough that
/// per-connection memory stays trivial.
const CHUNK_SIZE: usize = 128 * 1024;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

// ── GET /download?size=N ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub size: u64,
    #[serde(default)]
    pub test_id: Option<String>,
}

pub async fn download(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let max = state.config().max_download_bytes;
    if query.size > max {
        return Err(ApiError::bad_request(format!(
            "size {} exceeds maximum {max}",
            query.size
        )));
    }

    let guard = match &query.test_id {
        Some(test_id) => Some(orchestrator::authorize_stream(
            &state,
            test_id,
            StreamKind::Download,
            peer.ip(),
        )?),
        None => None,
    };

    if query.size == 0 {
        // Nothing to stream; the guard (if any) deregisters right here.
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Bytes::new(),
        )
            .into_response());
    }

    let gen = PayloadGen::new(query.size, guard);
    if wants_event_stream(&headers) {
        Ok(sse_download(gen))
    } else {
        Ok(raw_download(gen))
    }
}

/// Chunked random payload with warmup-rate sampling.
struct PayloadGen {
    rng: SmallRng,
    remaining: u64,
    sent: u64,
    started: Instant,
    last_sample: Instant,
    bytes_since_sample: u64,
    last_progress: Instant,
    guard: Option<StreamGuard>,
}

impl PayloadGen {
    fn new(size: u64, guard: Option<StreamGuard>) -> Self {
        let now = Instant::now();
        PayloadGen {
            rng: SmallRng::from_os_rng(),
            remaining: size,
            sent: 0,
            started: now,
            last_sample: now,
            bytes_since_sample: 0,
            last_progress: now,
            guard,
        }
    }

    fn terminated(&self) -> bool {
        self.guard.as_ref().is_some_and(|g| g.terminated())
    }

    fn next_chunk(&mut self) -> Bytes {
        let n = self.remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; n];
        self.rng.fill_bytes(&mut buf);
        self.remaining -= n as u64;
        self.sent += n as u64;
        self.bytes_since_sample += n as u64;

        // Transport back-pressure means generation tracks delivery, so
        // this doubles as the household warmup throughput sample.
        let since = self.last_sample.elapsed();
        if since >= PROGRESS_INTERVAL {
            if let Some(guard) = &self.guard {
                let bps = self.bytes_since_sample as f64 * 8.0 / since.as_secs_f64();
                guard.record_warmup_sample(bps);
            }
            self.last_sample = Instant::now();
            self.bytes_since_sample = 0;
        }

        Bytes::from(buf)
    }

    fn progress_due(&mut self) -> bool {
        if self.last_progress.elapsed() >= PROGRESS_INTERVAL {
            self.last_progress = Instant::now();
            true
        } else {
            false
        }
    }

    fn progress_json(&self) -> String {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64().max(1e-9);
        serde_json::json!({
            "bytes": self.sent,
            "elapsed_ms": elapsed.as_millis() as u64,
            "mbps": self.sent as f64 * 8.0 / secs / 1_000_000.0,
        })
        .to_string()
    }
}

fn raw_download(gen: PayloadGen) -> Response {
    let stream = futures::stream::unfold(gen, |mut gen| async move {
        if gen.remaining == 0 || gen.terminated() {
            return None;
        }
        let chunk = gen.next_chunk();
        Some((Ok::<_, std::convert::Infallible>(chunk), gen))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(stream))
        .expect("response build")
}

fn sse_download(gen: PayloadGen) -> Response {
    let stream = futures::stream::unfold((gen, false), |(mut gen, done)| async move {
        if done {
            return None;
        }
        if gen.terminated() {
            let event = Event::default().event("aborted").data(gen.progress_json());
            return Some((Ok::<_, std::convert::Infallible>(event), (gen, true)));
        }
        if gen.remaining == 0 {
            let event = Event::default().event("complete").data(gen.progress_json());
            return Some((Ok(event), (gen, true)));
        }
        if gen.progress_due() {
            let event = Event::default().event("progress").data(gen.progress_json());
            return Some((Ok(event), (gen, false)));
        }
        let chunk = gen.next_chunk();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&chunk);
        Some((Ok(Event::default().event("chunk").data(encoded)), (gen, false)))
    });

    Sse::new(stream).into_response()
}

// ── POST /upload ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub test_id: Option<String>,
}

pub async fn upload(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let cap = state.config().max_upload_bytes;
    if let Some(declared) = declared_length(&headers) {
        if declared > cap {
            return Err(ApiError::payload_too_large(format!(
                "declared size {declared} exceeds maximum {cap}"
            )));
        }
    }

    let guard = match &query.test_id {
        Some(test_id) => Some(orchestrator::authorize_stream(
            &state,
            test_id,
            StreamKind::Upload,
            peer.ip(),
        )?),
        None => None,
    };

    if wants_event_stream(&headers) {
        return Ok(sse_upload(body, cap, guard));
    }

    // Drain to EOF, counting. Payload bytes are dropped with each chunk.
    let started = Instant::now();
    let mut received: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(_) => break, // client went away; report what arrived
        };
        received += chunk.len() as u64;
        if received > cap {
            return Err(ApiError::payload_too_large(format!(
                "upload exceeds maximum {cap}"
            )));
        }
        if guard.as_ref().is_some_and(|g| g.terminated()) {
            break;
        }
    }

    let body = transfer_summary(received, started.elapsed());
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

fn sse_upload(body: Body, cap: u64, guard: Option<StreamGuard>) -> Response {
    struct UploadState {
        stream: axum::body::BodyDataStream,
        received: u64,
        started: Instant,
        last_progress: Instant,
        cap: u64,
        guard: Option<StreamGuard>,
    }

    let st = UploadState {
        stream: body.into_data_stream(),
        received: 0,
        started: Instant::now(),
        last_progress: Instant::now(),
        cap,
        guard,
    };

    let stream = futures::stream::unfold((st, false), |(mut st, done)| async move {
        if done {
            return None;
        }
        loop {
            if st.guard.as_ref().is_some_and(|g| g.terminated()) {
                let event = Event::default()
                    .event("aborted")
                    .data(transfer_summary(st.received, st.started.elapsed()));
                return Some((Ok::<_, std::convert::Infallible>(event), (st, true)));
            }

            let until_progress = PROGRESS_INTERVAL
                .checked_sub(st.last_progress.elapsed())
                .unwrap_or(Duration::ZERO);
            match tokio::time::timeout(until_progress, st.stream.next()).await {
                // Progress cadence fired before the next chunk.
                Err(_) => {
                    st.last_progress = Instant::now();
                    let event = Event::default()
                        .event("progress")
                        .data(transfer_summary(st.received, st.started.elapsed()));
                    return Some((Ok(event), (st, false)));
                }
                // Body finished: emit the summary and stop.
                Ok(None) => {
                    let event = Event::default()
                        .event("complete")
                        .data(transfer_summary(st.received, st.started.elapsed()));
                    return Some((Ok(event), (st, true)));
                }
                Ok(Some(Ok(chunk))) => {
                    st.received += chunk.len() as u64;
                    if st.received > st.cap {
                        let event = Event::default()
                            .event("error")
                            .data(format!("{{\"error\":\"upload exceeds maximum {}\"}}", st.cap));
                        return Some((Ok(event), (st, true)));
                    }
                    // Keep draining until the next progress tick.
                }
                Ok(Some(Err(_))) => {
                    let event = Event::default()
                        .event("aborted")
                        .data(transfer_summary(st.received, st.started.elapsed()));
                    return Some((Ok(event), (st, true)));
                }
            }
        }
    });

    Sse::new(stream).into_response()
}

// ── Helpers ─────────────────────────────────────────────────────────

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn transfer_summary(bytes: u64, elapsed: Duration) -> String {
    let duration_ms = elapsed.as_millis() as u64;
    let secs = elapsed.as_secs_f64().max(1e-9);
    let mbps = bytes as f64 * 8.0 / secs / 1_000_000.0;
    serde_json::json!({
        "bytes_received": bytes,
        "duration_ms": duration_ms,
        "observed_mbps": mbps,
    })
    .to_string()
}
