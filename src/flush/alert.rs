//! Reporting of batches that could not be persisted

use super::policy::FlushTrigger;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::error;

/// A batch abandoned after the retry policy was exhausted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushFailure {
    pub first_offset: u64,
    pub last_offset: u64,
    pub entries: usize,
    pub attempts: u32,
    pub trigger: FlushTrigger,
    pub error: String,
}

/// Operational collaborator notified of flush failures
pub trait AlertSink: Send + Sync + 'static {
    fn flush_failed(&self, failure: &FlushFailure);
}

/// Default sink: logs the failure
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn flush_failed(&self, failure: &FlushFailure) {
        error!(
            first_offset = failure.first_offset,
            last_offset = failure.last_offset,
            entries = failure.entries,
            attempts = failure.attempts,
            trigger = %failure.trigger,
            error = %failure.error,
            "Flush batch abandoned"
        );
    }
}

/// Forwards failures over a channel to whoever is alerting on them
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<FlushFailure>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlushFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn flush_failed(&self, failure: &FlushFailure) {
        LogAlertSink.flush_failed(failure);
        // Receiver gone means nobody is listening; the log line above still stands
        let _ = self.tx.send(failure.clone());
    }
}
