//! The `dispatch` module holds the prefetch buffer between the network
//! receive path and the application.
//!
//! - `entry`: the identities and the `DispatchedEntry` handed to a consumer.
//! - `channel`: the blocking, pausable, closable `DispatchChannel`.

pub mod channel;
pub mod entry;

pub use channel::{ChannelState, ChannelView, Dequeue, DispatchChannel, Timeout};
pub use entry::{ConsumerId, Destination, DispatchedEntry, InboundMessage, MessageId};
