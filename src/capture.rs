use std::sync::Mutex;

#[derive(Debug, Default)]
struct CaptureState {
    buffer: Vec<u8>,
    total: u64,
    truncated: bool,
}

/// Write-only tee buffer with a fixed byte cap. Bytes past the cap advance the
/// running total and set the truncated flag but are not retained. A cap <= 0
/// disables accumulation while still counting.
#[derive(Debug)]
pub struct BoundedCapture {
    cap: usize,
    state: Mutex<CaptureState>,
}

impl BoundedCapture {
    pub fn new(cap: i64) -> Self {
        Self {
            cap: cap.max(0) as usize,
            state: Mutex::new(CaptureState::default()),
        }
    }

    pub fn write(&self, chunk: &[u8]) {
        let mut state = self.state.lock().expect("capture lock poisoned");
        state.total += chunk.len() as u64;
        let remaining = self.cap.saturating_sub(state.buffer.len());
        let take = remaining.min(chunk.len());
        if take > 0 {
            state.buffer.extend_from_slice(&chunk[..take]);
        }
        if take < chunk.len() {
            state.truncated = true;
        }
    }

    /// Snapshot of the retained bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.state.lock().expect("capture lock poisoned").buffer.clone()
    }

    /// Total bytes observed, including discarded ones.
    pub fn total(&self) -> u64 {
        self.state.lock().expect("capture lock poisoned").total
    }

    pub fn truncated(&self) -> bool {
        self.state.lock().expect("capture lock poisoned").truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn retains_up_to_cap_and_counts_everything() {
        let cap = BoundedCapture::new(5);
        cap.write(b"abc");
        cap.write(b"defg");

        assert_eq!(cap.bytes(), b"abcde".to_vec());
        assert_eq!(cap.total(), 7);
        assert!(cap.truncated());
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let cap = BoundedCapture::new(4);
        cap.write(b"ab");
        cap.write(b"cd");

        assert_eq!(cap.bytes(), b"abcd".to_vec());
        assert_eq!(cap.total(), 4);
        assert!(!cap.truncated());
    }

    #[test]
    fn zero_cap_counts_without_retaining() {
        let cap = BoundedCapture::new(0);
        cap.write(b"hello");

        assert!(cap.bytes().is_empty());
        assert_eq!(cap.total(), 5);
        assert!(cap.truncated());
    }

    #[test]
    fn empty_writes_are_noops() {
        let cap = BoundedCapture::new(3);
        cap.write(b"");
        assert_eq!(cap.total(), 0);
        assert!(!cap.truncated());
    }
}
