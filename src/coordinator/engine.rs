//! Delivery coordinator
//!
//! Owns a `DispatchChannel<AckTracker>`: the queue of pending deliveries and
//! the outstanding set share the channel's mutex, so an entry is never out
//! of the queue without being outstanding, or the other way round.
//!
//! Concurrency and usage notes:
//! - `deliver` is called from network receive threads; `receive`,
//!   `acknowledge` and `fail` from application threads. All of them are
//!   `&self` and the coordinator is meant to be shared behind an `Arc`.
//! - Records are collected inside the critical section and handed to the
//!   `AckSink` after the lock is released.
//! - Records built inside a transaction are held by the tracker and emitted
//!   on `commit`; `rollback` drops them and undoes their effects. Expired
//!   acks never join a transaction.
//! - A failed entry is pushed back into the channel and stays tracked, but
//!   the tracker refuses to dispose of it again until it is received again.

use std::slice;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ack::{AckKind, AckTracker, AcknowledgmentRecord, PoisonCause, TransactionId};
use crate::config::Settings;
use crate::coordinator::policy::RedeliveryPolicy;
use crate::coordinator::sink::AckSink;
use crate::dispatch::{
    ChannelView, ConsumerId, Dequeue, Destination, DispatchChannel, DispatchedEntry,
    InboundMessage, MessageId, Timeout,
};
use crate::utils::error::{AckError, CoordinatorError};

/// What `fail` decided for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Pushed back to the head of the channel.
    Redelivered {
        redelivery_count: u32,
        /// Backoff the caller may apply before receiving again.
        delay: Duration,
    },
    /// Budget exhausted; acknowledged as poison and gone for good.
    Poisoned,
}

pub struct DeliveryCoordinator<S> {
    channel: DispatchChannel<AckTracker>,
    sink: S,
    policy: RedeliveryPolicy,
    default_destination: Destination,
    prefetch_limit: usize,
}

impl<S: AckSink> DeliveryCoordinator<S> {
    pub const DEFAULT_PREFETCH_LIMIT: usize = 1000;

    pub fn new(consumer_id: ConsumerId, default_destination: Destination, sink: S) -> Self {
        Self {
            channel: DispatchChannel::with_attached(AckTracker::new(consumer_id)),
            sink,
            policy: RedeliveryPolicy::default(),
            default_destination,
            prefetch_limit: Self::DEFAULT_PREFETCH_LIMIT,
        }
    }

    pub fn from_settings(settings: &Settings, sink: S) -> Self {
        let consumer_id = settings
            .consumer
            .id
            .as_deref()
            .map(ConsumerId::from)
            .unwrap_or_else(ConsumerId::generate);

        Self::new(
            consumer_id,
            Destination::from(settings.consumer.destination.as_str()),
            sink,
        )
        .with_policy(RedeliveryPolicy::from(&settings.redelivery))
        .with_prefetch_limit(settings.consumer.prefetch_limit)
        .with_ttl_check_interval(Duration::from_millis(
            settings.consumer.ttl_check_interval_ms,
        ))
    }

    pub fn with_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_prefetch_limit(mut self, prefetch_limit: usize) -> Self {
        self.prefetch_limit = prefetch_limit;
        self
    }

    pub fn with_ttl_check_interval(mut self, interval: Duration) -> Self {
        self.channel = self.channel.with_ttl_check_interval(interval);
        self
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.channel
            .with_lock(|_, tracker| tracker.consumer_id().clone())
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Inbound path: dispatch a message to this consumer.
    ///
    /// The destination comes from the message, then `destination_hint`, then
    /// the consumer's default. Dropped silently once the consumer is closed.
    pub fn deliver(&self, message: InboundMessage, destination_hint: Option<&Destination>) {
        self.channel.with_lock(|channel, tracker| {
            if channel.is_closed() {
                debug!(message_id = %message.message_id, "consumer closed, dropping delivery");
                return;
            }
            let destination = message
                .destination
                .clone()
                .or_else(|| destination_hint.cloned())
                .unwrap_or_else(|| self.default_destination.clone());
            let sequence = tracker.next_sequence();
            let entry =
                DispatchedEntry::new(message, destination, tracker.consumer_id().clone(), sequence);
            channel.enqueue(entry);
        });
    }

    /// Take the next entry for the application and record it as outstanding.
    ///
    /// Entries that expired while waiting in the channel are acknowledged as
    /// `Expired`, outside any open transaction, and never returned.
    pub fn receive(&self, timeout: Timeout) -> Dequeue {
        let mut outbox = Vec::new();
        let outcome = self.channel.dequeue_with(
            timeout,
            |tracker, entry| {
                let message_id = entry.message_id.clone();
                tracker.record_dispatch(entry);
                match tracker.build_expiry_ack(slice::from_ref(&message_id)) {
                    Ok(record) => settle(tracker, record, &mut outbox),
                    Err(e) => warn!(%message_id, error = %e, "could not ack expired entry"),
                }
            },
            |tracker, entry| tracker.record_dispatch(entry.clone()),
        );
        self.emit_all(outbox);
        outcome
    }

    pub fn receive_no_wait(&self) -> Dequeue {
        self.receive(Timeout::Immediate)
    }

    /// Standard ack: the application finished with this contiguous range.
    pub fn acknowledge(&self, ids: &[MessageId]) -> Result<AcknowledgmentRecord, CoordinatorError> {
        self.dispose(AckKind::Standard, ids, None)
    }

    pub fn acknowledge_individual(
        &self,
        id: &MessageId,
    ) -> Result<AcknowledgmentRecord, CoordinatorError> {
        self.dispose(AckKind::Individual, slice::from_ref(id), None)
    }

    /// Tell the broker the range arrived without resolving it.
    pub fn acknowledge_delivered(
        &self,
        ids: &[MessageId],
    ) -> Result<AcknowledgmentRecord, CoordinatorError> {
        self.dispose(AckKind::Delivered, ids, None)
    }

    pub fn discard_unmatched(
        &self,
        ids: &[MessageId],
    ) -> Result<AcknowledgmentRecord, CoordinatorError> {
        self.dispose(AckKind::Unmatched, ids, None)
    }

    /// Not part of an open transaction.
    pub fn expire(&self, ids: &[MessageId]) -> Result<AcknowledgmentRecord, CoordinatorError> {
        self.dispose(AckKind::Expired, ids, None)
    }

    pub fn poison(
        &self,
        ids: &[MessageId],
        cause: PoisonCause,
    ) -> Result<AcknowledgmentRecord, CoordinatorError> {
        self.dispose(AckKind::Poison, ids, Some(cause))
    }

    fn dispose(
        &self,
        kind: AckKind,
        ids: &[MessageId],
        cause: Option<PoisonCause>,
    ) -> Result<AcknowledgmentRecord, CoordinatorError> {
        let mut outbox = Vec::new();
        let record = self
            .channel
            .with_lock(|channel, tracker| -> Result<_, CoordinatorError> {
                ensure_open(channel, tracker)?;
                let record = match kind {
                    AckKind::Expired => tracker.build_expiry_ack(ids)?,
                    _ => tracker.build_ack(kind, ids, cause)?,
                };
                settle(tracker, record.clone(), &mut outbox);
                Ok(record)
            })?;
        self.emit_all(outbox);
        Ok(record)
    }

    /// The application could not process `id`.
    ///
    /// Under budget the message is acknowledged as `Redelivered` and pushed
    /// back to the head of the channel with its counter bumped. Once the
    /// budget is used up it is acknowledged as `Poison` instead. Failing an
    /// entry that is already back in the channel is `NotOutstanding`.
    pub fn fail(
        &self,
        id: &MessageId,
        cause: PoisonCause,
    ) -> Result<Disposition, CoordinatorError> {
        let mut outbox = Vec::new();
        let disposition = self.channel.with_lock(|channel, tracker| -> Result<_, CoordinatorError> {
            ensure_open(channel, tracker)?;
            if !tracker.is_outstanding(id) {
                return Err(AckError::NotOutstanding(id.clone()).into());
            }

            let redeliveries = tracker.redelivery_count(id);
            if self.policy.is_exhausted(redeliveries) {
                let cause = if self.policy.report_exhaustion {
                    warn!(
                        message_id = %id,
                        redeliveries,
                        cause = %cause,
                        "redelivery budget exhausted, poisoning message"
                    );
                    PoisonCause::redelivery_exhausted(redeliveries, &cause)
                } else {
                    debug!(message_id = %id, redeliveries, "redelivery budget exhausted");
                    cause
                };
                let record = tracker.build_ack(AckKind::Poison, slice::from_ref(id), Some(cause))?;
                settle(tracker, record, &mut outbox);
                return Ok(Disposition::Poisoned);
            }

            let record = tracker.build_ack(AckKind::Redelivered, slice::from_ref(id), None)?;
            settle(tracker, record, &mut outbox);

            let redelivery_count = tracker.redelivery_count(id);
            if let Some(entry) = tracker.entry(id) {
                channel.enqueue_first(entry.clone());
                tracker.mark_requeued(id);
            }
            debug!(message_id = %id, redelivery_count, cause = %cause, "message re-queued");
            Ok(Disposition::Redelivered {
                redelivery_count,
                delay: self.policy.delay_for(redelivery_count),
            })
        })?;
        self.emit_all(outbox);
        Ok(disposition)
    }

    pub fn begin(&self, transaction: TransactionId) -> Result<(), CoordinatorError> {
        self.channel.with_lock(|channel, tracker| -> Result<(), CoordinatorError> {
            ensure_open(channel, tracker)?;
            tracker.open_transaction(transaction)?;
            Ok(())
        })
    }

    /// Emit every record held by the transaction, in order.
    pub fn commit(&self) -> Result<Vec<AcknowledgmentRecord>, CoordinatorError> {
        let records = self
            .channel
            .with_lock(|channel, tracker| -> Result<_, CoordinatorError> {
                ensure_open(channel, tracker)?;
                Ok(tracker.close_transaction(true)?)
            })?;
        self.emit_all(records.clone());
        Ok(records)
    }

    pub fn rollback(&self) -> Result<(), CoordinatorError> {
        self.channel.with_lock(|channel, tracker| -> Result<(), CoordinatorError> {
            ensure_open(channel, tracker)?;
            tracker.close_transaction(false)?;
            Ok(())
        })
    }

    pub fn start(&self) {
        self.channel.start();
    }

    pub fn stop(&self) {
        self.channel.stop();
    }

    /// Wake blocked receivers with `Dequeue::Cancelled`.
    pub fn interrupt(&self) {
        self.channel.interrupt();
    }

    /// Close the consumer: pending and outstanding entries are discarded and
    /// an open transaction is rolled back. Idempotent.
    pub fn close(&self) {
        self.channel.with_lock(|channel, tracker| {
            if channel.is_closed() {
                return;
            }
            let pending = channel.close();
            if tracker.transaction_id().is_some() {
                let _ = tracker.close_transaction(false);
            }
            let outstanding = tracker.drain().len();
            info!(
                consumer = %tracker.consumer_id(),
                pending,
                outstanding,
                "consumer closed"
            );
        });
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    pub fn is_running(&self) -> bool {
        self.channel.is_running()
    }

    /// Delivered but unresolved entries, as the broker sees them.
    pub fn outstanding_count(&self) -> usize {
        self.channel.with_lock(|_, tracker| tracker.outstanding_len())
    }

    /// Entries still waiting in the channel.
    pub fn pending_count(&self) -> usize {
        self.channel.size()
    }

    /// Whether the flow-control layer may let more messages in.
    ///
    /// A re-queued entry is both pending and tracked; it is counted once.
    pub fn has_prefetch_capacity(&self) -> bool {
        self.channel.with_lock(|channel, tracker| {
            let in_flight = tracker
                .outstanding_len()
                .saturating_sub(tracker.requeued_len());
            channel.size() + in_flight < self.prefetch_limit
        })
    }

    pub fn prefetch_limit(&self) -> usize {
        self.prefetch_limit
    }

    pub fn redelivery_count(&self, id: &MessageId) -> u32 {
        self.channel
            .with_lock(|_, tracker| tracker.redelivery_count(id))
    }

    pub fn outstanding_ids(&self) -> Vec<MessageId> {
        self.channel.with_lock(|_, tracker| tracker.outstanding_ids())
    }

    fn emit_all(&self, records: Vec<AcknowledgmentRecord>) {
        for record in records {
            self.sink.emit_ack(record);
        }
    }
}

fn ensure_open(channel: &ChannelView<'_>, tracker: &AckTracker) -> Result<(), CoordinatorError> {
    if channel.is_closed() {
        return Err(CoordinatorError::Closed(tracker.consumer_id().clone()));
    }
    Ok(())
}

/// Hold transactional records, queue the rest for emission.
fn settle(
    tracker: &mut AckTracker,
    record: AcknowledgmentRecord,
    outbox: &mut Vec<AcknowledgmentRecord>,
) {
    if record.is_in_transaction() {
        if let Err(e) = tracker.hold(record) {
            warn!(error = %e, "transactional record without a transaction");
        }
    } else {
        outbox.push(record);
    }
}

impl<S> std::fmt::Debug for DeliveryCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCoordinator")
            .field("channel", &self.channel)
            .field("policy", &self.policy)
            .field("default_destination", &self.default_destination)
            .field("prefetch_limit", &self.prefetch_limit)
            .finish()
    }
}
