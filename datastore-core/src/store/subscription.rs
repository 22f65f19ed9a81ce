/*
    subscription.rs - Snapshot streams for store observers

    Every subscriber owns a bounded queue. Publishing never blocks: when a
    queue is full the subscriber's overflow policy decides what happens.

    - DropOldest: discard the oldest queued snapshot and count it; the next
      recv reports Lagged(n) before delivery resumes.
    - Disconnect: detach the subscriber; queued snapshots are still drained,
      then recv reports Overflowed once and the stream ends.
*/

use crate::metrics::{record_counter, LAGGED_SUBSCRIBERS};
use crate::store::snapshot::Snapshot;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

/// What happens when a subscriber's buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    Disconnect,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::DropOldest => "drop_oldest",
            OverflowPolicy::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(format!("unknown overflow policy: {}", other)),
        }
    }
}

/// Errors reported by [`Subscription::recv`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// This many snapshots were dropped because the buffer was full
    #[error("subscriber lagged behind by {0} snapshots")]
    Lagged(u64),

    /// The buffer overflowed under the disconnect policy
    #[error("subscriber buffer overflowed; subscription disconnected")]
    Overflowed,

    /// The store was closed or the subscription cancelled
    #[error("subscription closed")]
    Closed,
}

struct SlotQueue<T> {
    items: VecDeque<Snapshot<T>>,
    lagged: u64,
    overflowed: bool,
    closed: bool,
}

struct Slot<T> {
    queue: Mutex<SlotQueue<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, SlotQueue<T>> {
        // Queue state stays consistent even if a holder panicked.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the slot must be detached from the registry
    fn push(&self, store: &str, snapshot: Snapshot<T>) -> bool {
        let mut queue = self.lock();
        if queue.closed || queue.overflowed {
            return false;
        }

        let keep = if queue.items.len() < self.capacity {
            queue.items.push_back(snapshot);
            true
        } else {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    queue.items.pop_front();
                    queue.items.push_back(snapshot);
                    queue.lagged += 1;
                    record_counter(LAGGED_SUBSCRIBERS, store, 1);
                    true
                }
                OverflowPolicy::Disconnect => {
                    queue.overflowed = true;
                    warn!(store = store, capacity = self.capacity, "Subscriber overflowed, disconnecting");
                    false
                }
            }
        };
        drop(queue);
        self.notify.notify_one();
        keep
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Active subscribers of one store
pub(crate) struct SubscriberRegistry<T> {
    store: String,
    capacity: usize,
    policy: OverflowPolicy,
    next_id: u64,
    slots: BTreeMap<u64, Arc<Slot<T>>>,
    closed: bool,
}

impl<T> SubscriberRegistry<T> {
    pub(crate) fn new(store: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        SubscriberRegistry {
            store: store.into(),
            capacity: capacity.max(1),
            policy,
            next_id: 0,
            slots: BTreeMap::new(),
            closed: false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Register a subscriber whose queue starts with `current`
    pub(crate) fn register(
        registry: &Arc<Mutex<Self>>,
        current: Snapshot<T>,
        policy: Option<OverflowPolicy>,
    ) -> Subscription<T> {
        let mut guard = registry.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = Arc::new(Slot {
            queue: Mutex::new(SlotQueue {
                items: VecDeque::from([current]),
                lagged: 0,
                overflowed: false,
                closed: guard.closed,
            }),
            notify: Notify::new(),
            capacity: guard.capacity,
            policy: policy.unwrap_or(guard.policy),
        });

        let id = guard.next_id;
        guard.next_id += 1;
        if !guard.closed {
            guard.slots.insert(id, Arc::clone(&slot));
        }

        Subscription {
            id,
            slot,
            registry: Arc::downgrade(registry),
        }
    }

    /// Deliver a committed snapshot to every subscriber, in commit order
    pub(crate) fn publish(&mut self, snapshot: &Snapshot<T>) {
        let store = self.store.as_str();
        self.slots
            .retain(|_, slot| slot.push(store, snapshot.clone()));
    }

    fn remove(&mut self, id: u64) {
        if let Some(slot) = self.slots.remove(&id) {
            slot.close();
        }
    }

    /// End every subscription; later registrations start closed
    pub(crate) fn close_all(&mut self) {
        self.closed = true;
        for (_, slot) in std::mem::take(&mut self.slots) {
            slot.close();
        }
    }
}

/// Receiving end of a store's snapshot stream
///
/// Dropping the subscription cancels it.
pub struct Subscription<T> {
    id: u64,
    slot: Arc<Slot<T>>,
    registry: Weak<Mutex<SubscriberRegistry<T>>>,
}

impl<T> Subscription<T> {
    /// Wait for the next snapshot
    pub async fn recv(&mut self) -> Result<Snapshot<T>, RecvError> {
        loop {
            if let Some(result) = self.poll_queue() {
                return result;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Take the next snapshot if one is already queued
    pub fn try_recv(&mut self) -> Option<Result<Snapshot<T>, RecvError>> {
        self.poll_queue()
    }

    fn poll_queue(&self) -> Option<Result<Snapshot<T>, RecvError>> {
        let mut queue = self.slot.lock();
        if queue.lagged > 0 {
            let skipped = queue.lagged;
            queue.lagged = 0;
            return Some(Err(RecvError::Lagged(skipped)));
        }
        if let Some(snapshot) = queue.items.pop_front() {
            return Some(Ok(snapshot));
        }
        if queue.overflowed {
            queue.overflowed = false;
            queue.closed = true;
            return Some(Err(RecvError::Overflowed));
        }
        if queue.closed {
            return Some(Err(RecvError::Closed));
        }
        None
    }

    /// Stop receiving snapshots
    pub fn cancel(self) {}

    /// Adapt into a stream that ends once the subscription is closed
    pub fn into_stream(self) -> impl Stream<Item = Result<Snapshot<T>, RecvError>> {
        stream::unfold(self, |mut subscription| async move {
            match subscription.recv().await {
                Err(RecvError::Closed) => None,
                item => Some((item, subscription)),
            }
        })
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.id);
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("policy", &self.slot.policy)
            .finish()
    }
}
