//! The `coordinator` module is the façade the application and the network
//! receive path talk to.
//!
//! - `engine`: `DeliveryCoordinator`, which owns the channel and the tracker
//!   under one lock.
//! - `policy`: `RedeliveryPolicy`, the retry budget and backoff.
//! - `sink`: `AckSink`, where finished acknowledgment records go.

pub mod engine;
pub mod policy;
pub mod sink;

pub use engine::{DeliveryCoordinator, Disposition};
pub use policy::RedeliveryPolicy;
pub use sink::{AckSink, MemorySink};

#[cfg(test)]
mod tests;
