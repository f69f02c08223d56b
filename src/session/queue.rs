//! Bounded per-session outbound queue
//!
//! Every frame a session sends goes through this queue and is written by the
//! connection's sender task. Closing the queue is the session's shutdown
//! signal: the sender drains what is left and exits, the read loop observes
//! [`OutboundQueue::closed`] and stops consuming the socket.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::protocol::Packet;

/// What to do when a routed publish finds the queue full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait up to the block timeout for the sender to make room, then drop
    #[default]
    Block,
    /// Evict the oldest queued PUBLISH
    DropOldest,
    /// Discard the frame being pushed
    DropNewest,
}

/// Result of a push
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting this frame
    DroppedOldest(Packet),
    /// Not queued (queue full under `DropNewest`, or `Block` timed out)
    Dropped(Packet),
    /// The queue was closed
    Closed(Packet),
}

impl PushOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, PushOutcome::Queued | PushOutcome::DroppedOldest(_))
    }
}

#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Packet>>,
    capacity: usize,
    policy: OverflowPolicy,
    block_timeout: Duration,
    /// Signalled when a frame is queued (single consumer)
    readable: Notify,
    /// Signalled when a frame is taken out
    writable: Notify,
    closed: watch::Sender<bool>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy, block_timeout: Duration) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            policy,
            block_timeout,
            readable: Notify::new(),
            writable: Notify::new(),
            closed,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Push a routed frame, applying the overflow policy when full
    pub async fn push(&self, packet: Packet) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed(packet);
        }

        match self.policy {
            OverflowPolicy::Block => {
                let deadline = Instant::now() + self.block_timeout;
                self.push_until(packet, Some(deadline)).await
            }
            OverflowPolicy::DropOldest => {
                let mut queue = self.inner.lock();
                let mut evicted = None;
                if queue.len() >= self.capacity {
                    // Only routed publishes are evicted, never acks or CONNACK
                    match queue.iter().position(|p| matches!(p, Packet::Publish(_))) {
                        Some(pos) => evicted = queue.remove(pos),
                        None => return PushOutcome::Dropped(packet),
                    }
                }
                queue.push_back(packet);
                drop(queue);
                self.readable.notify_one();
                match evicted {
                    Some(old) => PushOutcome::DroppedOldest(old),
                    None => PushOutcome::Queued,
                }
            }
            OverflowPolicy::DropNewest => {
                let mut queue = self.inner.lock();
                if queue.len() >= self.capacity {
                    return PushOutcome::Dropped(packet);
                }
                queue.push_back(packet);
                drop(queue);
                self.readable.notify_one();
                PushOutcome::Queued
            }
        }
    }

    /// Push a frame the session itself owes the client (CONNACK, acks,
    /// redelivery). Waits for room regardless of policy.
    pub async fn push_wait(&self, packet: Packet) -> PushOutcome {
        self.push_until(packet, None).await
    }

    async fn push_until(&self, packet: Packet, deadline: Option<Instant>) -> PushOutcome {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            // Register interest before checking so a concurrent pop can't be missed
            notified.as_mut().enable();

            if self.is_closed() {
                return PushOutcome::Closed(packet);
            }
            {
                let mut queue = self.inner.lock();
                if queue.len() < self.capacity {
                    queue.push_back(packet);
                    drop(queue);
                    self.readable.notify_one();
                    return PushOutcome::Queued;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return PushOutcome::Dropped(packet);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Take the next frame, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<Packet> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(packet) = self.try_pop() {
                return Some(packet);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<Packet> {
        let packet = self.inner.lock().pop_front();
        if packet.is_some() {
            self.writable.notify_one();
        }
        packet
    }

    /// Close the queue. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            self.readable.notify_one();
            self.writable.notify_waiters();
        }
        !was_closed
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the queue has been closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
