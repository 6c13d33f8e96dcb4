use std::sync::Arc;

use tracing::warn;

use super::{BlobStore, RecordSink, StoreError};
use crate::record::LogRecord;

/// Longest prefix of `s` that fits in `max` bytes without splitting a
/// codepoint: from the byte cap, walk back while inside a multi-byte rune.
pub fn truncate_to_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Moves oversized inline bodies into the blob store, leaving a bounded
/// preview inline. Wraps any inner sink; records are never dropped here. A
/// failed blob write degrades to keeping the body inline.
pub struct DetachingSink<S> {
    inner: S,
    blobs: Arc<BlobStore>,
    threshold: Option<usize>,
    preview_bytes: usize,
}

impl<S: RecordSink> DetachingSink<S> {
    pub fn new(inner: S, blobs: Arc<BlobStore>, threshold: Option<usize>, preview_bytes: usize) -> Self {
        Self {
            inner,
            blobs,
            threshold,
            preview_bytes,
        }
    }

    fn detach_facet(&self, id: &str, body: &mut String, body_ref: &mut Option<String>) {
        let Some(threshold) = self.threshold else {
            return;
        };
        if body.len() <= threshold || body_ref.is_some() {
            return;
        }
        match self.blobs.put(body.as_bytes()) {
            Ok(r) => {
                *body = truncate_to_char_boundary(body, self.preview_bytes).to_string();
                *body_ref = Some(r);
            }
            Err(err) => {
                warn!("blob detach failed for record {id}, keeping body inline: {err}");
            }
        }
    }
}

impl<S: RecordSink> RecordSink for DetachingSink<S> {
    fn save(&self, record: &LogRecord) -> Result<(), StoreError> {
        let mut record = record.clone();
        self.detach_facet(&record.id, &mut record.request_body, &mut record.request_body_ref);
        self.detach_facet(&record.id, &mut record.response_body, &mut record.response_body_ref);
        self.inner.save(&record)
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CollectSink {
        saved: Mutex<Vec<LogRecord>>,
    }

    impl RecordSink for CollectSink {
        fn save(&self, record: &LogRecord) -> Result<(), StoreError> {
            self.saved.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn sink(threshold: Option<usize>, preview: usize) -> (TempDir, DetachingSink<Arc<CollectSink>>, Arc<CollectSink>, Arc<BlobStore>) {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path()).unwrap());
        let inner = Arc::new(CollectSink::default());
        let sink = DetachingSink::new(inner.clone(), blobs.clone(), threshold, preview);
        (dir, sink, inner, blobs)
    }

    #[test]
    fn oversized_request_body_moves_to_blob_with_preview() {
        let (_dir, sink, inner, blobs) = sink(Some(8), 4);
        let record = LogRecord {
            id: "r1".to_string(),
            request_body: "0123456789".to_string(),
            request_body_size: 10,
            response_body: "abcd".to_string(),
            ..Default::default()
        };
        sink.save(&record).unwrap();

        let saved = inner.saved.lock().unwrap();
        let got = &saved[0];
        let r = got.request_body_ref.as_deref().expect("request body detached");
        assert_eq!(got.request_body, "0123");
        assert_eq!(got.request_body_size, 10);
        assert_eq!(blobs.get(r).unwrap(), b"0123456789".to_vec());

        // Small response facet stays inline.
        assert_eq!(got.response_body, "abcd");
        assert!(got.response_body_ref.is_none());
    }

    #[test]
    fn preview_never_splits_a_codepoint() {
        assert_eq!(truncate_to_char_boundary("你好世界", 4), "你");
        assert_eq!(truncate_to_char_boundary("你好世界", 6), "你好");
        assert_eq!(truncate_to_char_boundary("abc", 10), "abc");
        assert_eq!(truncate_to_char_boundary("héllo", 2), "h");
    }

    #[test]
    fn detached_multibyte_preview_is_valid_utf8_prefix() {
        let (_dir, sink, inner, _blobs) = sink(Some(4), 4);
        let record = LogRecord {
            id: "r1".to_string(),
            request_body: "你好世界".to_string(),
            ..Default::default()
        };
        sink.save(&record).unwrap();
        let saved = inner.saved.lock().unwrap();
        assert_eq!(saved[0].request_body, "你");
    }

    #[test]
    fn disabled_threshold_passes_through() {
        let (_dir, sink, inner, _blobs) = sink(None, 4);
        let record = LogRecord {
            id: "r1".to_string(),
            request_body: "a very long body that would otherwise detach".to_string(),
            ..Default::default()
        };
        sink.save(&record).unwrap();
        let saved = inner.saved.lock().unwrap();
        assert_eq!(saved[0].request_body, record.request_body);
        assert!(saved[0].request_body_ref.is_none());
    }

    #[test]
    fn existing_ref_is_not_overwritten() {
        let (_dir, sink, inner, _blobs) = sink(Some(2), 1);
        let record = LogRecord {
            id: "r1".to_string(),
            response_body: "already detached elsewhere".to_string(),
            response_body_ref: Some("sha256:deadbeef".to_string()),
            ..Default::default()
        };
        sink.save(&record).unwrap();
        let saved = inner.saved.lock().unwrap();
        assert_eq!(saved[0].response_body, "already detached elsewhere");
        assert_eq!(saved[0].response_body_ref.as_deref(), Some("sha256:deadbeef"));
    }
}
