use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use reqwest::Client;
use tower::ServiceExt as _;
use tracing::debug;
use uuid::Uuid;

pub mod headers;
mod stream;

use crate::capture::BoundedCapture;
use crate::config::{DEFAULT_TIMEOUT_SECS, SharedConfig};
use crate::record::{LogRecord, now_millis};
use crate::router::{RouteError, is_ui_host, resolve_upstream};
use crate::store::RecordSink;

use self::headers::{capture_headers, filter_forward_headers, is_streaming_response};
use self::stream::{ResponseFinalize, StreamState, build_proxied_response, emit_record, finalize_record};

/// The header whose value lands in the record's tag column. It is captured,
/// not stripped: the upstream sees it too.
pub const TAG_HEADER: &str = "x-prismcat-tag";

#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    pub config: Arc<SharedConfig>,
    sink: Arc<dyn RecordSink>,
}

impl ProxyService {
    pub fn new(client: Client, config: Arc<SharedConfig>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            client,
            config,
            sink,
        }
    }
}

/// Joins the upstream base URL with the inbound path (single slash between)
/// and merges query strings with `&` when both sides carry one. The inbound
/// fragment never reaches this point.
fn build_target_url(base: &str, path: &str, query: Option<&str>) -> Result<reqwest::Url> {
    let (base_main, base_query) = match base.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (base, None),
    };
    let mut url = format!(
        "{}/{}",
        base_main.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let combined = match (
        base_query.filter(|q| !q.is_empty()),
        query.filter(|q| !q.is_empty()),
    ) {
        (Some(a), Some(b)) => Some(format!("{a}&{b}")),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    };
    if let Some(q) = combined {
        url.push('?');
        url.push_str(&q);
    }
    reqwest::Url::parse(&url).map_err(|e| anyhow!("invalid upstream target {url}: {e}"))
}

fn inbound_host(req_headers: &axum::http::HeaderMap) -> &str {
    req_headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

pub async fn handle_proxy(proxy: ProxyService, req: Request<Body>) -> Response<Body> {
    let start = Instant::now();
    let cfg = proxy.config.snapshot().await;
    let (parts, body) = req.into_parts();
    let host = inbound_host(&parts.headers).to_string();
    let method = parts.method;
    let path = parts.uri.path().to_string();

    let mut record = LogRecord {
        id: Uuid::new_v4().to_string(),
        created_at: now_millis(),
        method: method.to_string(),
        path: path.clone(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        request_headers: capture_headers(&parts.headers, &cfg.logging.sensitive_headers),
        tag: parts
            .headers
            .get(TAG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    };
    let preview_bytes = cfg.logging.body_preview_bytes;

    let (upstream_name, upstream) =
        match resolve_upstream(&host, &cfg.server.proxy_domains, &cfg.upstreams) {
            Ok((name, upstream)) => (name, upstream.clone()),
            Err(err) => {
                let status = match &err {
                    RouteError::MissingSubdomain => StatusCode::BAD_REQUEST,
                    RouteError::UnknownUpstream(name) => {
                        record.upstream = name.clone();
                        StatusCode::BAD_GATEWAY
                    }
                };
                record.error = err.to_string();
                record.latency_ms = start.elapsed().as_millis() as u64;
                emit_record(&proxy.sink, record);
                return (status, err.to_string()).into_response();
            }
        };
    record.upstream = upstream_name;

    let target = match build_target_url(&upstream.target, &path, parts.uri.query()) {
        Ok(url) => url,
        Err(err) => {
            record.error = err.to_string();
            record.latency_ms = start.elapsed().as_millis() as u64;
            emit_record(&proxy.sink, record);
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };
    record.target_url = target.to_string();

    // In-flight row: observers see the request before it completes. Failure
    // here never aborts forwarding.
    emit_record(&proxy.sink, record.clone());

    // Tee: every byte the upstream reads from the client body also lands in
    // the request-side capture. No buffering ahead of the forward.
    let request_capture = Arc::new(BoundedCapture::new(cfg.logging.max_request_body));
    let tee = request_capture.clone();
    let body_stream = body.into_data_stream().inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            tee.write(chunk);
        }
    });

    let timeout_secs = if upstream.timeout_secs == 0 {
        DEFAULT_TIMEOUT_SECS
    } else {
        upstream.timeout_secs
    };

    debug!("forwarding {} {} to {}", record.method, path, target);

    let result = proxy
        .client
        .request(method, target)
        .headers(filter_forward_headers(&parts.headers, true))
        .timeout(Duration::from_secs(timeout_secs))
        .body(reqwest::Body::wrap_stream(body_stream))
        .send()
        .await;

    let upstream_response = match result {
        Ok(resp) => resp,
        Err(err) => {
            let detail = if err.is_timeout() {
                format!("upstream error: timeout after {timeout_secs}s")
            } else {
                format!("upstream error: {err}")
            };
            let record = finalize_record(
                record,
                &request_capture,
                &BoundedCapture::new(0),
                preview_bytes,
                start.elapsed().as_millis() as u64,
                detail.clone(),
            );
            emit_record(&proxy.sink, record);
            return (StatusCode::BAD_GATEWAY, detail).into_response();
        }
    };

    let status = upstream_response.status();
    let upstream_headers = upstream_response.headers().clone();
    record.status_code = status.as_u16();
    record.streaming = is_streaming_response(&upstream_headers);
    record.response_headers = capture_headers(&upstream_headers, &cfg.logging.sensitive_headers);

    let finalize = ResponseFinalize {
        sink: proxy.sink.clone(),
        base: record,
        start,
        request_capture,
        response_capture: Arc::new(BoundedCapture::new(cfg.logging.max_response_body)),
        preview_bytes,
        state: Arc::new(Mutex::new(StreamState::default())),
    };
    build_proxied_response(
        finalize,
        upstream_response,
        status,
        filter_forward_headers(&upstream_headers, false),
    )
}

/// Single entry router: UI hosts go to the console's query surface, every
/// other host goes through upstream resolution and forwarding.
pub fn router(proxy: ProxyService, console: crate::api::ConsoleState) -> Router {
    let console_router = crate::api::router(console);
    Router::new().fallback(move |req: Request<Body>| {
        let proxy = proxy.clone();
        let console_router = console_router.clone();
        async move {
            let cfg = proxy.config.snapshot().await;
            if is_ui_host(inbound_host(req.headers()), &cfg.server.ui_hosts) {
                match console_router.oneshot(req).await {
                    Ok(resp) => resp.into_response(),
                    Err(err) => match err {},
                }
            } else {
                handle_proxy(proxy, req).await
            }
        }
    })
}

#[cfg(test)]
mod url_tests {
    use super::build_target_url;
    use pretty_assertions::assert_eq;

    #[test]
    fn joins_base_path_and_inbound_path_with_single_slash() {
        let url = build_target_url("https://example.test", "/v1/chat", None).unwrap();
        assert_eq!(url.as_str(), "https://example.test/v1/chat");

        let url = build_target_url("https://example.test/prefix/", "/v1/chat", None).unwrap();
        assert_eq!(url.as_str(), "https://example.test/prefix/v1/chat");
    }

    #[test]
    fn merges_queries_with_ampersand() {
        let url = build_target_url("https://example.test?team=a", "/v1", Some("x=1")).unwrap();
        assert_eq!(url.as_str(), "https://example.test/v1?team=a&x=1");

        let url = build_target_url("https://example.test", "/v1", Some("x=1")).unwrap();
        assert_eq!(url.as_str(), "https://example.test/v1?x=1");

        let url = build_target_url("https://example.test?team=a", "/v1", None).unwrap();
        assert_eq!(url.as_str(), "https://example.test/v1?team=a");
    }

    #[test]
    fn rejects_unparsable_targets() {
        assert!(build_target_url("not a url", "/v1", None).is_err());
    }
}
