//! Dispatch channel
//!
//! An ordered buffer of pending deliveries for one consumer. Network receive
//! threads push with [`DispatchChannel::enqueue`]; application threads pull
//! with [`DispatchChannel::dequeue`], which may block.
//!
//! Concurrency and usage notes:
//! - Everything sits behind one `parking_lot::Mutex`. The channel is generic
//!   over an attached state `X` that shares that mutex, so a caller can
//!   change the queue and its own bookkeeping in the same critical section
//!   (see [`DispatchChannel::with_lock`] and [`DispatchChannel::dequeue_with`]).
//! - Waiters park on a `Condvar`. `stop()`, `interrupt()` and `close()`
//!   wake every waiter; each wake reason is reported distinctly through
//!   [`Dequeue`].
//! - Lifecycle: `Created -> Running <-> Stopped -> Closed`. `Closed` is
//!   terminal and every operation on a closed channel is a silent no-op.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::dispatch::entry::DispatchedEntry;

/// How long a [`DispatchChannel::dequeue`] call may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until an entry is available or the channel is stopped/closed.
    Indefinite,
    /// Never block.
    Immediate,
    /// Block for at most this long, measured from the call.
    After(Duration),
}

impl Timeout {
    /// Maps the classic millisecond convention: `-1` (or any negative value)
    /// blocks indefinitely, `0` does not block, anything else is a bound.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => Self::Immediate,
            m if m < 0 => Self::Indefinite,
            m => Self::After(Duration::from_millis(m.unsigned_abs())),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        if value.is_zero() {
            Self::Immediate
        } else {
            Self::After(value)
        }
    }
}

/// Outcome of a dequeue. Everything except `Delivered` is a "not found".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeue {
    Delivered(DispatchedEntry),
    /// Non-blocking call found nothing servable.
    Empty,
    TimedOut,
    /// Woken by `stop()` or `interrupt()` while waiting.
    Cancelled,
    Closed,
}

impl Dequeue {
    pub fn into_entry(self) -> Option<DispatchedEntry> {
        match self {
            Self::Delivered(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Running,
    Stopped,
    Closed,
}

#[derive(Debug)]
struct Queue {
    slots: VecDeque<DispatchedEntry>,
    state: ChannelState,
    /// Bumped by `stop()` and `interrupt()`; a waiter that sees it move
    /// returns `Cancelled`.
    wake_epoch: u64,
}

impl Queue {
    fn pop_expired_head(&mut self, now_millis: i64) -> Option<DispatchedEntry> {
        if self.slots.front()?.is_expired_at(now_millis) {
            self.slots.pop_front()
        } else {
            None
        }
    }
}

struct Inner<X> {
    queue: Queue,
    attached: X,
}

/// Locked access to the channel, handed out by [`DispatchChannel::with_lock`].
///
/// Every method here runs inside the channel's critical section and never
/// blocks.
pub struct ChannelView<'a> {
    queue: &'a mut Queue,
    available: &'a Condvar,
}

impl ChannelView<'_> {
    /// Append to the tail. Stored but not servable while stopped; dropped
    /// when closed.
    pub fn enqueue(&mut self, entry: DispatchedEntry) {
        if self.queue.state == ChannelState::Closed {
            debug!(
                message_id = %entry.message_id,
                "dropping entry enqueued on closed channel"
            );
            return;
        }
        self.queue.slots.push_back(entry);
        if self.queue.state == ChannelState::Running {
            self.available.notify_one();
        }
    }

    /// Push a previously removed entry back to the head. It is the next entry
    /// served whatever is already pending, priority included.
    pub fn enqueue_first(&mut self, entry: DispatchedEntry) {
        if self.queue.state == ChannelState::Closed {
            debug!(
                message_id = %entry.message_id,
                "dropping entry re-queued on closed channel"
            );
            return;
        }
        self.queue.slots.push_front(entry);
        if self.queue.state == ChannelState::Running {
            self.available.notify_one();
        }
    }

    pub fn peek(&self) -> Option<&DispatchedEntry> {
        self.queue.slots.front()
    }

    pub fn start(&mut self) {
        if self.queue.state == ChannelState::Closed {
            return;
        }
        self.queue.state = ChannelState::Running;
        self.available.notify_all();
    }

    pub fn stop(&mut self) {
        if self.queue.state == ChannelState::Closed {
            return;
        }
        self.queue.state = ChannelState::Stopped;
        self.interrupt();
    }

    /// Wake every blocked `dequeue` with `Cancelled` without touching the
    /// lifecycle state.
    pub fn interrupt(&mut self) {
        self.queue.wake_epoch = self.queue.wake_epoch.wrapping_add(1);
        self.available.notify_all();
    }

    /// Terminal. Pending entries are discarded; returns how many.
    pub fn close(&mut self) -> usize {
        let discarded = self.queue.slots.len();
        if self.queue.state != ChannelState::Closed {
            self.queue.state = ChannelState::Closed;
            self.queue.slots.clear();
            debug!(discarded, "dispatch channel closed");
        }
        self.available.notify_all();
        discarded
    }

    pub fn clear(&mut self) {
        self.queue.slots.clear();
    }

    pub fn remove_all(&mut self) -> Vec<DispatchedEntry> {
        self.queue.slots.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.slots.is_empty()
    }

    pub fn size(&self) -> usize {
        self.queue.slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.state == ChannelState::Closed
    }

    pub fn is_running(&self) -> bool {
        self.queue.state == ChannelState::Running
    }

    pub fn state(&self) -> ChannelState {
        self.queue.state
    }
}

/// Single-consumer, multi-producer ordered buffer of pending deliveries.
pub struct DispatchChannel<X = ()> {
    inner: Mutex<Inner<X>>,
    available: Condvar,
    ttl_check_interval: Duration,
}

impl DispatchChannel<()> {
    pub fn new() -> Self {
        Self::with_attached(())
    }
}

impl Default for DispatchChannel<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<X> DispatchChannel<X> {
    /// Upper bound on how long a parked waiter sleeps before it re-checks
    /// the head for expired entries.
    pub const DEFAULT_TTL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

    /// A channel whose mutex also guards `attached`.
    pub fn with_attached(attached: X) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: Queue {
                    slots: VecDeque::new(),
                    state: ChannelState::Created,
                    wake_epoch: 0,
                },
                attached,
            }),
            available: Condvar::new(),
            ttl_check_interval: Self::DEFAULT_TTL_CHECK_INTERVAL,
        }
    }

    pub fn with_ttl_check_interval(mut self, interval: Duration) -> Self {
        self.ttl_check_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Run `f` with the channel and the attached state under one lock.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut ChannelView<'_>, &mut X) -> R) -> R {
        let mut inner = self.inner.lock();
        let Inner { queue, attached } = &mut *inner;
        let mut view = ChannelView {
            queue,
            available: &self.available,
        };
        f(&mut view, attached)
    }

    /// Blocking dequeue with hooks that run on the attached state while the
    /// lock is held.
    ///
    /// `on_expired` receives every expired entry found at the head, in
    /// encounter order; those entries are never returned. `on_taken` sees
    /// the entry that is about to be returned.
    pub fn dequeue_with<E, T>(&self, timeout: Timeout, mut on_expired: E, on_taken: T) -> Dequeue
    where
        E: FnMut(&mut X, DispatchedEntry),
        T: FnOnce(&mut X, &DispatchedEntry),
    {
        let deadline = match timeout {
            Timeout::After(limit) => Some(Instant::now() + limit),
            Timeout::Indefinite | Timeout::Immediate => None,
        };

        let mut inner = self.inner.lock();
        let epoch = inner.queue.wake_epoch;

        loop {
            let Inner { queue, attached } = &mut *inner;

            if queue.state == ChannelState::Closed {
                return Dequeue::Closed;
            }
            if queue.wake_epoch != epoch {
                return Dequeue::Cancelled;
            }

            let now_millis = Utc::now().timestamp_millis();
            while let Some(expired) = queue.pop_expired_head(now_millis) {
                trace!(message_id = %expired.message_id, "discarding expired entry");
                on_expired(attached, expired);
            }

            if queue.state == ChannelState::Running {
                if let Some(entry) = queue.slots.pop_front() {
                    on_taken(attached, &entry);
                    return Dequeue::Delivered(entry);
                }
            }

            let now = Instant::now();
            let wake_at = match (timeout, deadline) {
                (Timeout::Immediate, _) => return Dequeue::Empty,
                (_, Some(deadline)) if now >= deadline => return Dequeue::TimedOut,
                (_, Some(deadline)) => deadline.min(now + self.ttl_check_interval),
                (_, None) => now + self.ttl_check_interval,
            };
            // Spurious and periodic wakes just loop; the deadline is fixed.
            self.available.wait_until(&mut inner, wake_at);
        }
    }

    pub fn dequeue(&self, timeout: Timeout) -> Dequeue {
        self.dequeue_with(timeout, |_, _| {}, |_, _| {})
    }

    pub fn dequeue_no_wait(&self) -> Dequeue {
        self.dequeue(Timeout::Immediate)
    }

    pub fn enqueue(&self, entry: DispatchedEntry) {
        self.with_lock(|channel, _| channel.enqueue(entry));
    }

    pub fn enqueue_first(&self, entry: DispatchedEntry) {
        self.with_lock(|channel, _| channel.enqueue_first(entry));
    }

    /// Clone of the head entry. Expired entries are left in place.
    pub fn peek(&self) -> Option<DispatchedEntry> {
        self.with_lock(|channel, _| channel.peek().cloned())
    }

    pub fn start(&self) {
        self.with_lock(|channel, _| channel.start());
    }

    pub fn stop(&self) {
        self.with_lock(|channel, _| channel.stop());
    }

    pub fn interrupt(&self) {
        self.with_lock(|channel, _| channel.interrupt());
    }

    pub fn close(&self) -> usize {
        self.with_lock(|channel, _| channel.close())
    }

    pub fn clear(&self) {
        self.with_lock(|channel, _| channel.clear());
    }

    pub fn remove_all(&self) -> Vec<DispatchedEntry> {
        self.with_lock(|channel, _| channel.remove_all())
    }

    pub fn is_empty(&self) -> bool {
        self.with_lock(|channel, _| channel.is_empty())
    }

    pub fn size(&self) -> usize {
        self.with_lock(|channel, _| channel.size())
    }

    pub fn is_closed(&self) -> bool {
        self.with_lock(|channel, _| channel.is_closed())
    }

    pub fn is_running(&self) -> bool {
        self.with_lock(|channel, _| channel.is_running())
    }

    pub fn state(&self) -> ChannelState {
        self.with_lock(|channel, _| channel.state())
    }
}

impl<X> fmt::Debug for DispatchChannel<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DispatchChannel")
            .field("state", &inner.queue.state)
            .field("pending", &inner.queue.slots.len())
            .field("ttl_check_interval", &self.ttl_check_interval)
            .finish()
    }
}
