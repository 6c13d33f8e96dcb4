use std::collections::HashMap;

use axum::http::HeaderMap;

use crate::store::detach::truncate_to_char_boundary;

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn hop_by_hop_connection_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all("connection").iter() {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            out.push(token.to_ascii_lowercase());
        }
    }
    out
}

/// Copies headers minus the RFC 7230 hop-by-hop set and any token named by the
/// inbound `Connection` header. `Host` is excluded from request copies since
/// the outbound authority differs.
pub fn filter_forward_headers(src: &HeaderMap, strip_host: bool) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_header(&name_lower) {
            continue;
        }
        if strip_host && name_lower == "host" {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Masks a sensitive value: long values keep a recognizable head and tail.
/// Header values are arbitrary bytes, so the lossy-decoded string may carry
/// multi-byte runes; both cut points snap to codepoint boundaries.
fn mask_value(value: &str) -> String {
    if value.len() > 10 {
        let head = truncate_to_char_boundary(value, 5);
        let mut tail = value.len() - 3;
        while tail < value.len() && !value.is_char_boundary(tail) {
            tail += 1;
        }
        format!("{head}***{}", &value[tail..])
    } else {
        "***".to_string()
    }
}

/// Flattens headers into the captured map: lower-cased names, first value per
/// key, sensitive values masked. The forwarded headers are never touched.
pub fn capture_headers(src: &HeaderMap, sensitive: &[String]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if out.contains_key(&name_lower) {
            continue;
        }
        let raw = String::from_utf8_lossy(value.as_bytes()).into_owned();
        let v = if sensitive.iter().any(|s| s.eq_ignore_ascii_case(&name_lower)) {
            mask_value(&raw)
        } else {
            raw
        };
        out.insert(name_lower, v);
    }
    out
}

const STREAMING_MEDIA_TYPES: &[&str] = &[
    "text/event-stream",
    "application/x-ndjson",
    "application/stream+json",
    "application/json-seq",
];

/// Whether the response should be forwarded chunk-by-chunk with flushes.
pub fn is_streaming_response(headers: &HeaderMap) -> bool {
    if let Some(v) = headers.get("x-accel-buffering")
        && v.to_str().is_ok_and(|s| s.trim().eq_ignore_ascii_case("no"))
    {
        return true;
    }
    let Some(ct) = headers.get("content-type").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let media_type = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
    if STREAMING_MEDIA_TYPES.contains(&media_type.as_str()) {
        return true;
    }
    // Tolerant fallback for unparsable values.
    let lower = ct.to_ascii_lowercase();
    STREAMING_MEDIA_TYPES.iter().any(|t| lower.contains(t))
}
