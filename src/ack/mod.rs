//! The `ack` module turns disposal decisions into acknowledgment records.
//!
//! - `kind`: the closed set of ack kinds and their range semantics.
//! - `record`: `AcknowledgmentRecord`, `PoisonCause`, `TransactionId`.
//! - `tracker`: per-consumer outstanding set, redelivery counters and
//!   transaction undo log.

pub mod kind;
pub mod record;
pub mod tracker;

pub use kind::AckKind;
pub use record::{AcknowledgmentRecord, PoisonCause, PoisonKind, TransactionId};
pub use tracker::AckTracker;
