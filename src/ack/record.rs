//! Acknowledgment records
//!
//! `AcknowledgmentRecord` is what the transport encodes and sends back to
//! the broker. It is plain data and serializes with `serde`.
//!
//! Notes on fields:
//! - `first_message_id`/`last_message_id`: bounds of the covered range in
//!   dispatch order; equal for a single message
//! - `message_count`: entries in the range, except for `Redelivered` where it
//!   is the cumulative number of redeliveries of the covered entries
//! - `transaction_id`: set when the ack was built inside a transaction; such
//!   records are held until commit
//! - `poison_cause`: set only on `Poison` records

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ack::kind::AckKind;
use crate::dispatch::{ConsumerId, Destination, MessageId};
use crate::utils::ids::opaque_id;

opaque_id!(
    /// Identity of a local transaction grouping acknowledgments.
    TransactionId
);

impl TransactionId {
    pub fn generate() -> Self {
        Self(format!("tx-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoisonKind {
    /// The message listener or receiving code reported a failure.
    ListenerFailure,
    /// The message could not be decoded or understood.
    Unprocessable,
    /// Converted from a redelivery once the retry budget ran out.
    RedeliveryExhausted,
}

/// Why a message was poisoned, kept serializable for dead-lettering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisonCause {
    pub kind: PoisonKind,
    pub message: String,
}

impl PoisonCause {
    pub fn new(kind: PoisonKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn listener_failure(message: impl Into<String>) -> Self {
        Self::new(PoisonKind::ListenerFailure, message)
    }

    pub fn from_error(error: &dyn std::error::Error) -> Self {
        Self::listener_failure(error.to_string())
    }

    pub fn redelivery_exhausted(limit: u32, last_failure: &PoisonCause) -> Self {
        Self::new(
            PoisonKind::RedeliveryExhausted,
            format!(
                "exceeded {limit} redeliveries; last failure: {}",
                last_failure.message
            ),
        )
    }
}

impl fmt::Display for PoisonCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgmentRecord {
    pub kind: AckKind,
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub first_message_id: MessageId,
    pub last_message_id: MessageId,
    pub message_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poison_cause: Option<PoisonCause>,
}

impl AcknowledgmentRecord {
    pub fn is_in_transaction(&self) -> bool {
        self.transaction_id.is_some()
    }

    pub fn is_single(&self) -> bool {
        self.first_message_id == self.last_message_id
    }
}
