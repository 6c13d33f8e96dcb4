use std::sync::Arc;

use thiserror::Error;

use crate::record::LogRecord;

pub mod blob;
pub mod db;
pub mod detach;
pub mod queue;

pub use blob::BlobStore;
pub use db::{ListFilter, LogStats, LogStore, RecordSummary};
pub use detach::DetachingSink;
pub use queue::AsyncSink;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The async stage's queue was full; the record was dropped.
    #[error("record queue is full")]
    QueueFull,
    /// Save was attempted after close began.
    #[error("record queue is closed")]
    QueueClosed,
    #[error("invalid blob ref: {0}")]
    InvalidRef(String),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A destination for log records. The persistence stack is
/// `LogStore <- DetachingSink <- AsyncSink`; construction is bottom-up and
/// close runs top-down so the queue drains before the inner sinks go away.
pub trait RecordSink: Send + Sync {
    fn save(&self, record: &LogRecord) -> Result<(), StoreError>;
    fn close(&self) -> Result<(), StoreError>;
}

impl<T: RecordSink + ?Sized> RecordSink for Arc<T> {
    fn save(&self, record: &LogRecord) -> Result<(), StoreError> {
        (**self).save(record)
    }

    fn close(&self) -> Result<(), StoreError> {
        (**self).close()
    }
}
