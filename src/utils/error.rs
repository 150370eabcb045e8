//! Error types for the delivery core.
//!
//! Blocking-receive outcomes (timeout, cancellation, closed channel) are not
//! errors; they are variants of [`crate::dispatch::Dequeue`]. What lives here
//! are the protocol-consistency failures that must reach the caller that
//! asked for an acknowledgment.

use thiserror::Error;

use crate::ack::TransactionId;
use crate::dispatch::{ConsumerId, Destination, MessageId};

/// Failures raised while building or settling an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    /// The message was never recorded, was already resolved (double ack),
    /// or is waiting in the channel for redelivery.
    #[error("message {0} is not outstanding")]
    NotOutstanding(MessageId),

    /// A multi-entry range skips an outstanding entry, or names one twice.
    #[error("range {first}..{last} is not contiguous in the outstanding set")]
    NonContiguousRange { first: MessageId, last: MessageId },

    /// One record names one destination; the range reaches into another.
    #[error("range mixes destinations {first} and {other}")]
    MixedDestinations { first: Destination, other: Destination },

    #[error("a poison ack requires a failure cause")]
    PoisonWithoutCause,

    #[error("an ack must cover at least one message")]
    EmptyRange,

    #[error("an individual ack covers exactly one message, got {0}")]
    IndividualRange(usize),

    #[error("transaction {0} is already open")]
    TransactionAlreadyOpen(TransactionId),

    #[error("no transaction is open")]
    NoTransaction,

    #[error("unknown ack kind code {0}")]
    UnknownKind(u8),
}

/// Failures surfaced by [`crate::coordinator::DeliveryCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Ack(#[from] AckError),

    /// Disposal requested after the consumer was closed and its outstanding
    /// entries discarded.
    #[error("consumer {0} is closed")]
    Closed(ConsumerId),
}
