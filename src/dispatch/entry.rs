//! Dispatched entries
//!
//! `InboundMessage` is what the codec layer hands to the receive path;
//! `DispatchedEntry` is the same message once it has been assigned to a
//! consumer, with a dispatch sequence number and a redelivery counter.
//!
//! Notes on fields:
//! - `sequence`: per-consumer, monotonically increasing, assigned once. A
//!   re-queued entry keeps it; only `redelivery_count` moves.
//! - `priority`: 0-9 like JMS priorities. It only matters when an entry is
//!   pushed back with `enqueue_first`; steady-state order is FIFO.
//! - `expiration`: milliseconds since UNIX epoch, `None` for no TTL.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::utils::ids::opaque_id;

opaque_id!(
    /// Producer-assigned message identity, treated as an immutable key.
    MessageId
);

opaque_id!(
    /// Queue or topic the message was routed from.
    Destination
);

opaque_id!(
    /// Identity of the consumer a message is dispatched to.
    ConsumerId
);

impl ConsumerId {
    /// A fresh random consumer identity.
    pub fn generate() -> Self {
        Self(format!("consumer-{}", uuid::Uuid::new_v4()))
    }
}

/// A message as delivered by the receive path, before it is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub destination: Option<Destination>,
    pub priority: u8,
    pub expiration: Option<i64>,
    /// Redeliveries the broker already performed before this delivery.
    pub redelivery_count: u32,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(message_id: impl Into<MessageId>, payload: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            destination: None,
            priority: DispatchedEntry::DEFAULT_PRIORITY,
            expiration: None,
            redelivery_count: 0,
            payload: payload.into(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<Destination>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(DispatchedEntry::MAX_PRIORITY);
        self
    }

    pub fn with_expiration(mut self, expiration_millis: i64) -> Self {
        self.expiration = Some(expiration_millis);
        self
    }

    /// Sets the expiration to `ttl` from now.
    pub fn expiring_in(self, ttl: Duration) -> Self {
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.with_expiration(Utc::now().timestamp_millis().saturating_add(ttl))
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedEntry {
    pub message_id: MessageId,
    pub destination: Destination,
    pub consumer_id: ConsumerId,
    pub sequence: u64,
    pub redelivery_count: u32,
    pub priority: u8,
    pub expiration: Option<i64>,
    pub payload: String,
}

impl DispatchedEntry {
    pub const DEFAULT_PRIORITY: u8 = 4;
    pub const MAX_PRIORITY: u8 = 9;

    pub fn new(
        message: InboundMessage,
        destination: Destination,
        consumer_id: ConsumerId,
        sequence: u64,
    ) -> Self {
        Self {
            message_id: message.message_id,
            destination,
            consumer_id,
            sequence,
            redelivery_count: message.redelivery_count,
            priority: message.priority,
            expiration: message.expiration,
            payload: message.payload,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    /// An expiration of zero or below means "never", as on the wire.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        matches!(self.expiration, Some(expiration) if expiration > 0 && now_millis >= expiration)
    }
}
