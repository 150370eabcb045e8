use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::ack::AcknowledgmentRecord;

/// Receives finished acknowledgment records for encoding and sending.
///
/// Called outside the coordinator's lock. Implementations must not block
/// for long; resending after a connection drop is their concern.
pub trait AckSink: Send + Sync {
    fn emit_ack(&self, record: AcknowledgmentRecord);
}

/// Hand records to a transport task.
impl AckSink for UnboundedSender<AcknowledgmentRecord> {
    fn emit_ack(&self, record: AcknowledgmentRecord) {
        if let Err(e) = self.send(record) {
            warn!(
                first = %e.0.first_message_id,
                kind = ?e.0.kind,
                "ack sink closed, dropping record"
            );
        }
    }
}

impl<S: AckSink + ?Sized> AckSink for Arc<S> {
    fn emit_ack(&self, record: AcknowledgmentRecord) {
        (**self).emit_ack(record);
    }
}

/// Keeps every emitted record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AcknowledgmentRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns what was emitted so far.
    pub fn take(&self) -> Vec<AcknowledgmentRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AckSink for MemorySink {
    fn emit_ack(&self, record: AcknowledgmentRecord) {
        self.records.lock().push(record);
    }
}
