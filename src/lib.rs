//! # mqdispatch
//!
//! `mqdispatch` is the consumer-side delivery core of a messaging client:
//! the prefetch buffer between the network receive path and the
//! application, and the bookkeeping that turns "done with this message"
//! decisions into acknowledgment records for the broker.
//!
//! ## Core Modules
//!
//! - `dispatch`: the blocking, pausable `DispatchChannel` and the entries it carries.
//! - `ack`: ack kinds, `AcknowledgmentRecord` and the per-consumer `AckTracker`.
//! - `coordinator`: `DeliveryCoordinator`, which binds the two under one lock and
//!   applies the redelivery policy.
//! - `config`: loading settings from files and environment variables.
//! - `utils`: error types, identifiers and logging setup.
//!
//! Wire encoding, connections and persistence live outside this crate; records
//! leave through the `AckSink` trait.

pub mod ack;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod utils;

pub use ack::{AckKind, AcknowledgmentRecord, PoisonCause, PoisonKind, TransactionId};
pub use coordinator::{AckSink, DeliveryCoordinator, Disposition, RedeliveryPolicy};
pub use dispatch::{Dequeue, DispatchChannel, DispatchedEntry, InboundMessage, MessageId, Timeout};
pub use utils::error::{AckError, CoordinatorError};
