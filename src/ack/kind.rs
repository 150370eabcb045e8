use serde::{Deserialize, Serialize};

use crate::utils::error::AckError;

/// How a run of delivered messages was disposed of.
///
/// The discriminants are the protocol codes the codec layer puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    /// Reached the client past the prefetch limit; not a disposal decision.
    Delivered = 0,
    /// Processing failed for good. Carries a cause.
    Poison = 1,
    /// Processed; the broker may discard the range.
    Standard = 2,
    /// Processing failed but the message gets another attempt.
    Redelivered = 3,
    /// Exactly one message, anywhere in the outstanding set.
    Individual = 4,
    /// Did not match a durable subscription's selector.
    Unmatched = 5,
    /// Time-to-live elapsed before it reached the application.
    Expired = 6,
}

impl AckKind {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether building this ack resolves the covered entries.
    pub const fn removes_entries(self) -> bool {
        !matches!(self, Self::Delivered | Self::Redelivered)
    }

    pub const fn requires_contiguity(self) -> bool {
        !matches!(self, Self::Individual)
    }
}

impl TryFrom<u8> for AckKind {
    type Error = AckError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Delivered,
            1 => Self::Poison,
            2 => Self::Standard,
            3 => Self::Redelivered,
            4 => Self::Individual,
            5 => Self::Unmatched,
            6 => Self::Expired,
            other => return Err(AckError::UnknownKind(other)),
        })
    }
}
