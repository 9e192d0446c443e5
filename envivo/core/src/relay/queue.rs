//! Relay Delivery Queue
//!
//! Bounded single-producer/single-consumer queue between the dispatcher and a
//! websocket connection task.
//!
//! The producer never waits on the socket: when the queue is full the
//! configured [`BufferOverflowPolicy`] decides what happens. The queue is a
//! live-view buffer, not a durable log, so the default is to drop the oldest
//! pending record.
//!
//! # Closing
//!
//! - [`RelayQueue::close`] is the producer-side end of stream. Items already
//!   queued are still handed out, then [`RelayQueue::pop`] returns `None`.
//! - [`RelayQueue::discard`] is the consumer-side teardown. Pending items are
//!   dropped and the queue is closed.
//!
//! Both are idempotent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Default number of records buffered per relay
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Policy for a full queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum BufferOverflowPolicy {
    /// Evict the oldest pending record to make room (default)
    #[default]
    DropOldest,
    /// Wait up to `timeout_ms` for room, then drop the new record
    Block {
        /// How long the producer may wait, in milliseconds
        timeout_ms: u64,
    },
}

impl BufferOverflowPolicy {
    /// Block policy with the given timeout
    #[must_use]
    pub fn block(timeout: Duration) -> Self {
        Self::Block {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl std::str::FromStr for BufferOverflowPolicy {
    type Err = String;

    /// Parses `drop-oldest` or `block:<millis>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "drop-oldest" {
            return Ok(Self::DropOldest);
        }
        if let Some(ms) = s.strip_prefix("block:") {
            return ms
                .parse()
                .map(|timeout_ms| Self::Block { timeout_ms })
                .map_err(|_| format!("invalid block timeout {ms:?}"));
        }
        Err(format!(
            "expected \"drop-oldest\" or \"block:<millis>\", got {s:?}"
        ))
    }
}

/// What happened to a pushed item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued with room to spare
    Enqueued,
    /// Queued after evicting the oldest pending item
    EvictedOldest,
    /// Not queued: the queue stayed full for the whole block timeout
    DroppedNew,
}

/// The queue no longer accepts items
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("relay queue is closed")]
pub struct QueueClosed;

/// Counters for a relay queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted into the queue
    pub enqueued: u64,
    /// Items handed to the consumer
    pub delivered: u64,
    /// Items evicted or refused because the queue was full
    pub dropped: u64,
}

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<String>,
    closed: bool,
}

/// Bounded SPSC queue of serialized records
#[derive(Debug)]
pub struct RelayQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    policy: BufferOverflowPolicy,
    item_ready: Notify,
    space_ready: Notify,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RelayQueue {
    /// Create a queue; a capacity of zero is raised to one
    #[must_use]
    pub fn new(capacity: usize, policy: BufferOverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Maximum number of pending items
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy in effect
    #[must_use]
    pub fn policy(&self) -> BufferOverflowPolicy {
        self.policy
    }

    /// Number of pending items
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no items are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Snapshot of the queue counters
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Push an item, applying the overflow policy when full
    ///
    /// # Errors
    ///
    /// [`QueueClosed`] if the queue was closed or discarded.
    pub async fn push(&self, item: String) -> Result<PushOutcome, QueueClosed> {
        match self.policy {
            BufferOverflowPolicy::DropOldest => self.push_evicting(item),
            BufferOverflowPolicy::Block { timeout_ms } => {
                self.push_blocking(item, Duration::from_millis(timeout_ms))
                    .await
            }
        }
    }

    fn push_evicting(&self, item: String) -> Result<PushOutcome, QueueClosed> {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueClosed);
            }
            let outcome = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::EvictedOldest
            } else {
                PushOutcome::Enqueued
            };
            inner.items.push_back(item);
            outcome
        };
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.item_ready.notify_one();
        Ok(outcome)
    }

    async fn push_blocking(
        &self,
        item: String,
        timeout: Duration,
    ) -> Result<PushOutcome, QueueClosed> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(QueueClosed);
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    drop(inner);
                    self.enqueued.fetch_add(1, Ordering::Relaxed);
                    self.item_ready.notify_one();
                    return Ok(PushOutcome::Enqueued);
                }
            }

            if tokio::time::timeout_at(deadline, self.space_ready.notified())
                .await
                .is_err()
            {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(PushOutcome::DroppedNew);
            }
        }
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue is closed and drained, or discarded.
    pub async fn pop(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    self.space_ready.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    /// Close from the producer side; pending items are still delivered
    ///
    /// Returns `true` if this call closed the queue.
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        if newly_closed {
            self.item_ready.notify_one();
            self.space_ready.notify_one();
        }
        newly_closed
    }

    /// Close from the consumer side and drop pending items
    ///
    /// Returns the number of items dropped.
    pub fn discard(&self) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let dropped = inner.items.len();
            inner.items.clear();
            dropped
        };
        self.item_ready.notify_one();
        self.space_ready.notify_one();
        dropped
    }
}
