use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError, sync_channel};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use super::{RecordSink, StoreError};
use crate::record::LogRecord;

/// Decouples the forwarding path from durable writes: a bounded channel feeds
/// exactly one worker thread that drives the inner sink sequentially, so all
/// blocking I/O stays off the request tasks and per-id ordering is preserved
/// by channel FIFO.
///
/// Enqueue never blocks. A full queue drops the record (counted); once close
/// has begun, saves fail fast with `QueueClosed`. Close drops the sender and
/// joins the worker, which drains every accepted record and then closes the
/// inner sink. At-most-once delivery, losing only back-pressure drops.
pub struct AsyncSink {
    sender: Mutex<Option<SyncSender<LogRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl AsyncSink {
    pub fn new<S>(inner: S, capacity: usize) -> Self
    where
        S: RecordSink + 'static,
    {
        let (sender, receiver) = sync_channel::<LogRecord>(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("prismcat-store".to_string())
            .spawn(move || {
                for record in receiver {
                    if let Err(err) = inner.save(&record) {
                        warn!("record save failed (id={}): {err}", record.id);
                    }
                }
                debug!("record queue drained, closing inner sink");
                if let Err(err) = inner.close() {
                    warn!("inner sink close failed: {err}");
                }
            })
            .expect("failed to spawn store worker thread");

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RecordSink for AsyncSink {
    fn save(&self, record: &LogRecord) -> Result<(), StoreError> {
        let guard = self.sender.lock().expect("queue lock poisoned");
        let Some(sender) = guard.as_ref() else {
            return Err(StoreError::QueueClosed);
        };
        match sender.try_send(record.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(StoreError::QueueClosed),
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        // Taking the sender fails further saves fast and, once the last clone
        // drops, ends the worker's receive loop after a full drain.
        let sender = self.sender.lock().expect("queue lock poisoned").take();
        drop(sender);
        if let Some(worker) = self.worker.lock().expect("queue lock poisoned").take()
            && worker.join().is_err()
        {
            warn!("store worker thread panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct CollectSink {
        saved: Mutex<Vec<String>>,
        closed: AtomicBool,
        /// While held by a test, save calls block: a frozen worker.
        gate: Mutex<()>,
    }

    impl RecordSink for CollectSink {
        fn save(&self, record: &LogRecord) -> Result<(), StoreError> {
            let _gate = self.gate.lock().unwrap();
            self.saved.lock().unwrap().push(record.id.clone());
            Ok(())
        }

        fn close(&self) -> Result<(), StoreError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(id: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn close_drains_all_accepted_saves_in_order() {
        let inner = Arc::new(CollectSink::default());
        let sink = AsyncSink::new(inner.clone(), 64);

        for i in 0..10 {
            sink.save(&record(&format!("r{i}"))).unwrap();
        }
        sink.close().unwrap();

        let saved = inner.saved.lock().unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("r{i}")).collect();
        assert_eq!(*saved, expected);
        assert!(inner.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn full_queue_drops_and_counts_without_blocking() {
        let inner = Arc::new(CollectSink::default());
        let frozen = inner.gate.lock().unwrap();
        let sink = AsyncSink::new(inner.clone(), 2);

        let mut accepted = 0u64;
        let mut rejected = 0u64;
        for i in 0..6 {
            match sink.save(&record(&format!("r{i}"))) {
                Ok(()) => accepted += 1,
                Err(StoreError::QueueFull) => rejected += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        // The worker may have pulled at most one record before freezing, so
        // capacity 2 accepts two or three saves; every other save is a
        // counted drop.
        assert!((2..=3).contains(&accepted), "accepted={accepted}");
        assert_eq!(rejected, 6 - accepted);
        assert_eq!(sink.dropped(), rejected);

        drop(frozen);
        sink.close().unwrap();
        assert_eq!(inner.saved.lock().unwrap().len() as u64, accepted);
    }

    #[test]
    fn save_after_close_fails_fast() {
        let inner = Arc::new(CollectSink::default());
        let sink = AsyncSink::new(inner, 4);
        sink.close().unwrap();
        assert!(matches!(sink.save(&record("late")), Err(StoreError::QueueClosed)));
    }

    #[test]
    fn concurrent_saves_and_close_deliver_each_accepted_record_once() {
        let inner = Arc::new(CollectSink::default());
        let sink = Arc::new(AsyncSink::new(inner.clone(), 128));

        let mut handles = Vec::new();
        for t in 0..4 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                let mut accepted = Vec::new();
                for i in 0..25 {
                    let id = format!("t{t}-{i}");
                    if sink.save(&record(&id)).is_ok() {
                        accepted.push(id);
                    }
                }
                accepted
            }));
        }
        sink.close().unwrap();

        let mut accepted: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        accepted.sort();

        let mut saved = inner.saved.lock().unwrap().clone();
        saved.sort();
        assert_eq!(saved, accepted);
    }
}
