use super::error::{AckError, CoordinatorError};
use super::logging;
use crate::dispatch::{ConsumerId, MessageId};

#[test]
fn logging_init_accepts_levels() {
    // Should not panic, even with a filter it cannot parse.
    logging::init("info");
    logging::init("debug");
    logging::init("mqdispatch=trace");
    logging::init("not a [valid filter");
}

#[test]
fn ack_errors_render_the_offending_ids() {
    let err = AckError::NonContiguousRange {
        first: MessageId::from("m1"),
        last: MessageId::from("m3"),
    };
    assert_eq!(
        err.to_string(),
        "range m1..m3 is not contiguous in the outstanding set"
    );
    assert_eq!(
        AckError::NotOutstanding(MessageId::from("m7")).to_string(),
        "message m7 is not outstanding"
    );
}

#[test]
fn coordinator_error_wraps_ack_error_transparently() {
    let err: CoordinatorError = AckError::PoisonWithoutCause.into();
    assert_eq!(err.to_string(), "a poison ack requires a failure cause");

    let closed = CoordinatorError::Closed(ConsumerId::from("consumer-1"));
    assert_eq!(closed.to_string(), "consumer consumer-1 is closed");
}
