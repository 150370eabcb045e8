//! Acknowledgment tracker
//!
//! Keeps, for one consumer, the entries that were handed to the application
//! and not yet resolved, ordered by dispatch sequence. `build_ack` is the
//! only way to resolve them and it refuses anything that would make the
//! broker's view diverge from ours: unknown ids, double acks, ranges with
//! holes.
//!
//! An entry pushed back into the channel for redelivery stays tracked (the
//! broker still counts it) but is marked re-queued: it cannot be disposed of
//! again until it is dispatched again.
//!
//! Concurrency note: the tracker has no lock of its own. It is meant to be
//! the attached state of a `DispatchChannel` so it changes under the same
//! mutex as the queue.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::ack::kind::AckKind;
use crate::ack::record::{AcknowledgmentRecord, PoisonCause, TransactionId};
use crate::dispatch::{ConsumerId, DispatchedEntry, MessageId};
use crate::utils::error::AckError;

#[derive(Debug)]
enum Undo {
    Removed {
        entry: DispatchedEntry,
        redeliveries: u32,
    },
    Redelivered {
        message_id: MessageId,
    },
}

#[derive(Debug)]
struct Transaction {
    id: TransactionId,
    undo: Vec<Undo>,
    held: Vec<AcknowledgmentRecord>,
}

#[derive(Debug)]
pub struct AckTracker {
    consumer_id: ConsumerId,
    outstanding: BTreeMap<u64, DispatchedEntry>,
    index: HashMap<MessageId, u64>,
    redeliveries: HashMap<MessageId, u32>,
    requeued: HashSet<MessageId>,
    transaction: Option<Transaction>,
    next_sequence: u64,
}

impl AckTracker {
    pub fn new(consumer_id: ConsumerId) -> Self {
        Self {
            consumer_id,
            outstanding: BTreeMap::new(),
            index: HashMap::new(),
            redeliveries: HashMap::new(),
            requeued: HashSet::new(),
            transaction: None,
            next_sequence: 1,
        }
    }

    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    /// Allocate the next dispatch sequence number for this consumer.
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Add an entry to the outstanding set.
    ///
    /// An entry that is already outstanding (a redelivery dispatched again)
    /// keeps its place and its tracked redelivery count.
    pub fn record_dispatch(&mut self, mut entry: DispatchedEntry) {
        self.requeued.remove(&entry.message_id);
        if let Some(sequence) = self.index.get(&entry.message_id).copied() {
            entry.sequence = sequence;
            entry.redelivery_count = self.redelivery_count(&entry.message_id);
            self.outstanding.insert(sequence, entry);
            return;
        }

        self.redeliveries
            .entry(entry.message_id.clone())
            .or_insert(entry.redelivery_count);
        self.index.insert(entry.message_id.clone(), entry.sequence);
        self.outstanding.insert(entry.sequence, entry);
    }

    /// Validate a disposal of `ids` and turn it into a record.
    ///
    /// `ids` may come in any order. All but `Individual` must form an
    /// unbroken run of the outstanding set and share one destination.
    /// `cause` is required for `Poison` and ignored otherwise.
    pub fn build_ack(
        &mut self,
        kind: AckKind,
        ids: &[MessageId],
        cause: Option<PoisonCause>,
    ) -> Result<AcknowledgmentRecord, AckError> {
        self.build(kind, ids, cause, true)
    }

    /// `Expired` ack that ignores an open transaction: the record carries no
    /// transaction id and a rollback does not bring the entries back.
    pub fn build_expiry_ack(
        &mut self,
        ids: &[MessageId],
    ) -> Result<AcknowledgmentRecord, AckError> {
        self.build(AckKind::Expired, ids, None, false)
    }

    fn build(
        &mut self,
        kind: AckKind,
        ids: &[MessageId],
        cause: Option<PoisonCause>,
        transactional: bool,
    ) -> Result<AcknowledgmentRecord, AckError> {
        if ids.is_empty() {
            return Err(AckError::EmptyRange);
        }
        let poison_cause = match kind {
            AckKind::Poison => Some(cause.ok_or(AckError::PoisonWithoutCause)?),
            _ => None,
        };
        if kind == AckKind::Individual && ids.len() != 1 {
            return Err(AckError::IndividualRange(ids.len()));
        }

        let mut sequences = ids
            .iter()
            .map(|id| match self.index.get(id) {
                Some(sequence) if !self.requeued.contains(id) => Ok(*sequence),
                _ => Err(AckError::NotOutstanding(id.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        sequences.sort_unstable();

        let first = sequences[0];
        let last = sequences[sequences.len() - 1];
        let duplicated = sequences.windows(2).any(|pair| pair[0] == pair[1]);
        let span = self.outstanding.range(first..=last).count();
        if duplicated || (kind.requires_contiguity() && span != sequences.len()) {
            return Err(AckError::NonContiguousRange {
                first: self.outstanding[&first].message_id.clone(),
                last: self.outstanding[&last].message_id.clone(),
            });
        }

        let first_entry = &self.outstanding[&first];
        let last_entry = &self.outstanding[&last];
        if let Some(stray) = sequences
            .iter()
            .map(|sequence| &self.outstanding[sequence])
            .find(|entry| entry.destination != first_entry.destination)
        {
            return Err(AckError::MixedDestinations {
                first: first_entry.destination.clone(),
                other: stray.destination.clone(),
            });
        }
        let mut record = AcknowledgmentRecord {
            kind,
            consumer_id: self.consumer_id.clone(),
            destination: last_entry.destination.clone(),
            first_message_id: first_entry.message_id.clone(),
            last_message_id: last_entry.message_id.clone(),
            message_count: u32::try_from(sequences.len()).unwrap_or(u32::MAX),
            transaction_id: self
                .transaction
                .as_ref()
                .filter(|_| transactional)
                .map(|tx| tx.id.clone()),
            poison_cause,
        };

        if kind == AckKind::Redelivered {
            record.message_count = sequences
                .iter()
                .map(|sequence| self.mark_redelivered(*sequence))
                .fold(0u32, u32::saturating_add);
        } else if kind.removes_entries() {
            for sequence in &sequences {
                self.resolve(*sequence, transactional);
            }
        }

        debug!(
            consumer = %self.consumer_id,
            kind = ?kind,
            first = %record.first_message_id,
            last = %record.last_message_id,
            count = record.message_count,
            "built ack"
        );
        Ok(record)
    }

    fn mark_redelivered(&mut self, sequence: u64) -> u32 {
        let Some(entry) = self.outstanding.get_mut(&sequence) else {
            return 0;
        };
        let counter = self
            .redeliveries
            .entry(entry.message_id.clone())
            .or_insert(0);
        *counter += 1;
        entry.redelivery_count = *counter;
        if let Some(tx) = self.transaction.as_mut() {
            tx.undo.push(Undo::Redelivered {
                message_id: entry.message_id.clone(),
            });
        }
        *counter
    }

    fn resolve(&mut self, sequence: u64, transactional: bool) {
        let Some(entry) = self.outstanding.remove(&sequence) else {
            return;
        };
        self.index.remove(&entry.message_id);
        let redeliveries = self.redeliveries.remove(&entry.message_id).unwrap_or(0);
        if let Some(tx) = self.transaction.as_mut().filter(|_| transactional) {
            tx.undo.push(Undo::Removed {
                entry,
                redeliveries,
            });
        }
    }

    pub fn open_transaction(&mut self, id: TransactionId) -> Result<(), AckError> {
        if let Some(open) = &self.transaction {
            return Err(AckError::TransactionAlreadyOpen(open.id.clone()));
        }
        debug!(consumer = %self.consumer_id, transaction = %id, "transaction opened");
        self.transaction = Some(Transaction {
            id,
            undo: Vec::new(),
            held: Vec::new(),
        });
        Ok(())
    }

    /// Commit returns the records held during the transaction, in the order
    /// they were built. Rollback restores every removed entry with its
    /// redelivery count, reverts redelivery increments and returns nothing.
    pub fn close_transaction(
        &mut self,
        commit: bool,
    ) -> Result<Vec<AcknowledgmentRecord>, AckError> {
        let tx = self.transaction.take().ok_or(AckError::NoTransaction)?;
        if commit {
            debug!(
                consumer = %self.consumer_id,
                transaction = %tx.id,
                records = tx.held.len(),
                "transaction committed"
            );
            return Ok(tx.held);
        }

        for undo in tx.undo.into_iter().rev() {
            match undo {
                Undo::Removed {
                    entry,
                    redeliveries,
                } => {
                    self.redeliveries
                        .insert(entry.message_id.clone(), redeliveries);
                    self.index.insert(entry.message_id.clone(), entry.sequence);
                    self.outstanding.insert(entry.sequence, entry);
                }
                Undo::Redelivered { message_id } => {
                    if let Some(counter) = self.redeliveries.get_mut(&message_id) {
                        *counter = counter.saturating_sub(1);
                        let count = *counter;
                        if let Some(entry) = self
                            .index
                            .get(&message_id)
                            .and_then(|sequence| self.outstanding.get_mut(sequence))
                        {
                            entry.redelivery_count = count;
                        }
                    }
                }
            }
        }
        debug!(consumer = %self.consumer_id, transaction = %tx.id, "transaction rolled back");
        Ok(Vec::new())
    }

    /// Stash a transactional record until commit.
    pub fn hold(&mut self, record: AcknowledgmentRecord) -> Result<(), AckError> {
        let tx = self.transaction.as_mut().ok_or(AckError::NoTransaction)?;
        tx.held.push(record);
        Ok(())
    }

    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction.as_ref().map(|tx| &tx.id)
    }

    pub fn redelivery_count(&self, message_id: &MessageId) -> u32 {
        self.redeliveries.get(message_id).copied().unwrap_or(0)
    }

    /// Held by the application: tracked and not waiting in the channel for
    /// redelivery.
    pub fn is_outstanding(&self, message_id: &MessageId) -> bool {
        self.index.contains_key(message_id) && !self.requeued.contains(message_id)
    }

    /// Mark a tracked entry as pushed back into the channel. Disposals of it
    /// fail with `NotOutstanding` until `record_dispatch` sees it again.
    pub fn mark_requeued(&mut self, message_id: &MessageId) {
        if self.index.contains_key(message_id) {
            self.requeued.insert(message_id.clone());
        }
    }

    pub fn is_requeued(&self, message_id: &MessageId) -> bool {
        self.requeued.contains(message_id)
    }

    pub fn requeued_len(&self) -> usize {
        self.requeued.len()
    }

    pub fn entry(&self, message_id: &MessageId) -> Option<&DispatchedEntry> {
        self.index
            .get(message_id)
            .and_then(|sequence| self.outstanding.get(sequence))
    }

    /// Unresolved entries as the broker sees them: re-queued entries count,
    /// and removals made inside an open transaction still count until it
    /// commits.
    pub fn outstanding_len(&self) -> usize {
        let held_back = self.transaction.as_ref().map_or(0, |tx| {
            tx.undo
                .iter()
                .filter(|undo| matches!(undo, Undo::Removed { .. }))
                .count()
        });
        self.outstanding.len() + held_back
    }

    pub fn outstanding_ids(&self) -> Vec<MessageId> {
        self.outstanding
            .values()
            .filter(|entry| !self.requeued.contains(&entry.message_id))
            .map(|entry| entry.message_id.clone())
            .collect()
    }

    /// Forget everything, including an open transaction. Used when the
    /// consumer closes.
    pub fn drain(&mut self) -> Vec<DispatchedEntry> {
        self.transaction = None;
        self.index.clear();
        self.redeliveries.clear();
        self.requeued.clear();
        std::mem::take(&mut self.outstanding).into_values().collect()
    }
}
