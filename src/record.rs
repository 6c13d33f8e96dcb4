use std::collections::HashMap;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::capture::BoundedCapture;

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One row of the request log. Written once at request arrival (in-flight,
/// status unknown) and rewritten under the same id at completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    /// Unix milliseconds at request arrival. 0 means "stamp at save time".
    pub created_at: i64,
    pub upstream: String,
    pub target_url: String,

    pub method: String,
    pub path: String,
    pub query: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body_ref: Option<String>,
    pub request_body_size: u64,

    /// 0 together with a non-empty error means no response headers were seen.
    pub status_code: u16,
    pub response_headers: HashMap<String, String>,
    pub streaming: bool,
    pub response_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_ref: Option<String>,
    pub response_body_size: u64,

    pub latency_ms: u64,
    /// Non-empty when forwarding failed or was aborted.
    pub error: String,
    /// True when any capture hit its cap.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// First value for a case-insensitive header key out of a captured map.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// One direction's body view derived from its capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyFacet {
    pub body: String,
    pub size: u64,
    pub truncated: bool,
}

/// Bounded decompression: reads at most `limit + 1` bytes of output, the extra
/// byte acting as a truncation sentinel. None when the encoding is unknown or
/// the payload does not decode.
fn decompress_limited(bytes: &[u8], encoding: &str, limit: usize) -> Option<(Vec<u8>, bool)> {
    let take = limit as u64 + 1;
    let mut out = Vec::new();
    let read = match encoding {
        "gzip" => flate2::read::GzDecoder::new(bytes).take(take).read_to_end(&mut out),
        "deflate" => flate2::read::DeflateDecoder::new(bytes)
            .take(take)
            .read_to_end(&mut out),
        "br" => brotli::Decompressor::new(bytes, 4096).take(take).read_to_end(&mut out),
        _ => return None,
    };
    read.ok()?;
    let hit_sentinel = out.len() > limit;
    out.truncate(limit);
    Some((out, hit_sentinel))
}

fn content_encoding(headers: &HashMap<String, String>) -> Option<String> {
    header_value(headers, "content-encoding").map(|v| v.trim().to_ascii_lowercase())
}

/// Derives the inline body view for one direction.
///
/// Compressed payloads are decoded up to the preview bound for display; the
/// size always counts the bytes the capture observed on the wire. Non-UTF-8
/// payloads collapse to a placeholder rather than inline binary.
pub fn build_body_facet(
    capture: &BoundedCapture,
    headers: &HashMap<String, String>,
    preview_bytes: usize,
) -> BodyFacet {
    let captured = capture.bytes();
    let size = capture.total();
    let mut truncated = capture.truncated();

    if size == 0 {
        return BodyFacet {
            body: String::new(),
            size,
            truncated,
        };
    }

    let encoding = content_encoding(headers).filter(|e| matches!(e.as_str(), "gzip" | "deflate" | "br"));
    let (display, decompress_failed) = match &encoding {
        Some(enc) if preview_bytes > 0 => match decompress_limited(&captured, enc, preview_bytes) {
            Some((decoded, hit_sentinel)) => {
                truncated |= hit_sentinel;
                (decoded, false)
            }
            None => (captured, true),
        },
        Some(_) => (captured, false),
        None => (captured, false),
    };

    let body = match String::from_utf8(display) {
        Ok(text) => text,
        Err(_) => {
            let detail = if decompress_failed {
                format!("; {} decode failed", encoding.as_deref().unwrap_or("?"))
            } else if encoding.is_some() && preview_bytes == 0 {
                format!("; {} encoded", encoding.as_deref().unwrap_or("?"))
            } else {
                String::new()
            };
            format!("[binary content omitted; {size} bytes captured{detail}]")
        }
    };

    BodyFacet {
        body,
        size,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn plain_text_body_passes_through() {
        let cap = BoundedCapture::new(64);
        cap.write(b"{\"m\":1}");
        let facet = build_body_facet(&cap, &headers(&[("content-type", "application/json")]), 4096);

        assert_eq!(facet.body, "{\"m\":1}");
        assert_eq!(facet.size, 7);
        assert!(!facet.truncated);
    }

    #[test]
    fn gzip_body_is_decoded_for_display_but_size_counts_wire_bytes() {
        let plain = b"hello compressed world".repeat(8);
        let compressed = gzip(&plain);
        let cap = BoundedCapture::new(1024 * 1024);
        cap.write(&compressed);

        let facet = build_body_facet(&cap, &headers(&[("content-encoding", "gzip")]), 4096);
        assert_eq!(facet.body.as_bytes(), &plain[..]);
        assert_eq!(facet.size, compressed.len() as u64);
        assert!(!facet.truncated);
    }

    #[test]
    fn gzip_decode_stops_at_preview_bound_and_flags_truncation() {
        let plain = vec![b'a'; 10_000];
        let compressed = gzip(&plain);
        let cap = BoundedCapture::new(1024 * 1024);
        cap.write(&compressed);

        let facet = build_body_facet(&cap, &headers(&[("content-encoding", "gzip")]), 100);
        assert_eq!(facet.body.len(), 100);
        assert!(facet.truncated);
    }

    #[test]
    fn corrupt_gzip_falls_back_to_placeholder() {
        let cap = BoundedCapture::new(64);
        cap.write(&[0x1f, 0x8b, 0xff, 0x00, 0x01, 0x02]);
        let facet = build_body_facet(&cap, &headers(&[("content-encoding", "gzip")]), 4096);

        assert!(facet.body.starts_with("[binary content omitted;"), "{}", facet.body);
        assert!(facet.body.contains("gzip decode failed"));
    }

    #[test]
    fn binary_body_becomes_placeholder() {
        let cap = BoundedCapture::new(64);
        cap.write(&[0xff, 0xfe, 0x00, 0x01]);
        let facet = build_body_facet(&cap, &HashMap::new(), 4096);

        assert_eq!(facet.body, "[binary content omitted; 4 bytes captured]");
        assert_eq!(facet.size, 4);
    }

    #[test]
    fn empty_capture_yields_empty_facet() {
        let cap = BoundedCapture::new(64);
        let facet = build_body_facet(&cap, &HashMap::new(), 4096);
        assert_eq!(facet, BodyFacet::default());
    }

    #[test]
    fn header_value_is_case_insensitive() {
        let map = headers(&[("content-type", "text/plain")]);
        assert_eq!(header_value(&map, "Content-Type"), Some("text/plain"));
        assert_eq!(header_value(&map, "missing"), None);
    }
}
