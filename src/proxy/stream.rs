use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode};
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::capture::BoundedCapture;
use crate::record::{LogRecord, build_body_facet};
use crate::store::{RecordSink, StoreError};

#[derive(Default)]
pub(super) struct StreamState {
    /// Set when the upstream body ran to its natural end.
    completed: bool,
    error: Option<String>,
    finished: bool,
}

/// Emits the finalized record exactly once, whenever the proxied response
/// body is done with: natural end of the upstream stream, an upstream error
/// mid-stream, or the client going away and dropping the body.
pub(super) struct ResponseFinalize {
    pub sink: Arc<dyn RecordSink>,
    /// Everything known before the body started: identity, route, request
    /// facet headers, response status/headers/streaming flag.
    pub base: LogRecord,
    pub start: Instant,
    pub request_capture: Arc<BoundedCapture>,
    pub response_capture: Arc<BoundedCapture>,
    pub preview_bytes: usize,
    pub state: Arc<Mutex<StreamState>>,
}

pub(super) fn emit_record(sink: &Arc<dyn RecordSink>, record: LogRecord) {
    match sink.save(&record) {
        Ok(()) => {}
        Err(StoreError::QueueFull) => {
            debug!("record {} dropped: persistence queue full", record.id)
        }
        Err(err) => warn!("record {} save failed: {err}", record.id),
    }
}

/// Fills both body facets from the captures and stamps latency and error.
pub(super) fn finalize_record(
    mut record: LogRecord,
    request_capture: &BoundedCapture,
    response_capture: &BoundedCapture,
    preview_bytes: usize,
    latency_ms: u64,
    error: String,
) -> LogRecord {
    let request = build_body_facet(request_capture, &record.request_headers, preview_bytes);
    let response = build_body_facet(response_capture, &record.response_headers, preview_bytes);
    record.request_body = request.body;
    record.request_body_size = request.size;
    record.response_body = response.body;
    record.response_body_size = response.size;
    record.truncated = request.truncated || response.truncated;
    record.latency_ms = latency_ms;
    record.error = error;
    record
}

impl Drop for ResponseFinalize {
    fn drop(&mut self) {
        let (completed, error) = {
            let mut state = self.state.lock().expect("stream state lock poisoned");
            if state.finished {
                return;
            }
            state.finished = true;
            (state.completed, state.error.take())
        };

        let error = error.unwrap_or_else(|| {
            if completed {
                String::new()
            } else {
                "client disconnected before response completed".to_string()
            }
        });

        let record = finalize_record(
            self.base.clone(),
            &self.request_capture,
            &self.response_capture,
            self.preview_bytes,
            self.start.elapsed().as_millis() as u64,
            error,
        );
        emit_record(&self.sink, record);
    }
}

/// Streams the upstream body to the client while teeing every chunk into the
/// response capture. The finalize guard rides inside the stream closure so
/// dropping the response body (for any reason) emits the final record.
pub(super) fn build_proxied_response(
    finalize: ResponseFinalize,
    upstream_response: reqwest::Response,
    status: StatusCode,
    forward_headers: HeaderMap,
) -> Response<Body> {
    let end_state = finalize.state.clone();

    let data = upstream_response.bytes_stream().map(move |item| {
        let guard = &finalize;
        match item {
            Ok(chunk) => {
                guard.response_capture.write(&chunk);
                Ok(chunk)
            }
            Err(err) => {
                let mut state = guard.state.lock().expect("stream state lock poisoned");
                if state.error.is_none() {
                    state.error = Some(format!("upstream stream error: {err}"));
                }
                Err(std::io::Error::other(err))
            }
        }
    });
    // Polled only after the upstream stream ends; a client abort drops the
    // body before this runs, which is how incompleteness is detected.
    let data = data.chain(futures_util::stream::poll_fn(move |_cx| {
        end_state
            .lock()
            .expect("stream state lock poisoned")
            .completed = true;
        Poll::Ready(None)
    }));

    let mut builder = Response::builder().status(status);
    for (name, value) in forward_headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(data))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
