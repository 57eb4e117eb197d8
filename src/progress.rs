//! Progress events pushed to a caller-identified channel.
//!
//! Every request may carry a connection identifier and an
//! [`Arc<dyn ProgressSink>`]. The pipeline pushes a [`ProgressEvent`] when a
//! document starts, after every page (or batch of pages), when the result is
//! extracted, and when processing finishes or fails.
//!
//! Delivery is fire-and-forget: `publish` never blocks the worker and never
//! reports failure. Pages complete out of order, so "converted X of N" events
//! count completions, not page numbers; callers must not read page order
//! into them.
//!
//! # Example
//!
//! ```rust
//! use edgequake_ocr::{ChannelProgressSink, ProgressEvent, ProgressSink, ProgressStatus};
//! use futures::StreamExt;
//!
//! # tokio_test::block_on(async {
//! let (sink, mut events) = ChannelProgressSink::new();
//! sink.publish(ProgressEvent::new("conn-1", "hello", ProgressStatus::Informational));
//! drop(sink);
//! let first = events.next().await.unwrap();
//! assert_eq!(first.connection_id, "conn-1");
//! # });
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Category of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Running commentary ("converted 3 of 10 pages").
    Informational,
    /// The message carries the extracted document as JSON.
    Extracted,
    /// Processing stopped; no further events follow on this request.
    Failed,
    /// Processing completed; no further events follow on this request.
    Finished,
}

/// One progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub connection_id: String,
    pub message: String,
    pub status: ProgressStatus,
    pub timestamp: SystemTime,
}

impl ProgressEvent {
    pub fn new(
        connection_id: impl Into<String>,
        message: impl Into<String>,
        status: ProgressStatus,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            message: message.into(),
            status,
            timestamp: SystemTime::now(),
        }
    }

    /// True for `Failed` and `Finished`.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ProgressStatus::Failed | ProgressStatus::Finished)
    }
}

/// Receives progress events from the pipeline.
///
/// Implementations must be `Send + Sync`: events are published from the
/// coordinating task while page workers run on other threads.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Discards every event. The default when a request carries no sink.
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded tokio channel.
///
/// The receiving half is exposed as a `Stream`, which makes it easy to
/// bridge into a WebSocket, SSE response, or test assertion.
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new() -> (Arc<Self>, UnboundedReceiverStream<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), UnboundedReceiverStream::new(rx))
    }
}

impl ProgressSink for ChannelProgressSink {
    fn publish(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            debug!("Progress receiver dropped; event discarded");
        }
    }
}

/// Shared handle type stored in requests.
pub type ProgressHandle = Arc<dyn ProgressSink>;

/// A sink bound to one connection identifier.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: ProgressHandle,
    connection_id: String,
}

impl ProgressReporter {
    pub fn new(sink: ProgressHandle, connection_id: impl Into<String>) -> Self {
        Self {
            sink,
            connection_id: connection_id.into(),
        }
    }

    /// A reporter that drops everything.
    pub fn silent() -> Self {
        Self::new(Arc::new(NoopProgressSink), "")
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn send(&self, status: ProgressStatus, message: impl Into<String>) {
        self.sink
            .publish(ProgressEvent::new(self.connection_id.clone(), message, status));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(ProgressStatus::Informational, message);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("connection_id", &self.connection_id)
            .field("sink", &"<dyn ProgressSink>")
            .finish()
    }
}
