//! Topic subscription registry with per-subscriber type filtering.
//!
//! Each subscription is a (topic, accepted-type set, callback) triple. The
//! accepted-type set is an explicit allow-list: an empty set receives
//! nothing, not everything. Delivery on one topic never blocks or touches
//! another topic's subscribers.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::message::Payload;

// ── Delivery outcome ─────────────────────────────────────────────

/// Returned by an event callback to decide whether the subscription stays
/// registered. Returning [`Stop`](Delivery::Stop) unsubscribes from within
/// the delivery pass itself, which is the removal-safe equivalent of
/// calling unsubscribe inside one's own handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Keep the subscription.
    Retain,
    /// Drop the subscription; it will not be delivered to again.
    Stop,
}

/// Callback invoked for each accepted payload on the subscribed topic.
pub type EventCallback = Box<dyn FnMut(&Payload) -> Delivery + Send>;

// ── SubscriptionHandle ───────────────────────────────────────────

/// Opaque handle naming one registered subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: String,
    id: u64,
}

impl SubscriptionHandle {
    pub(crate) fn new(topic: String, id: u64) -> Self {
        Self { topic, id }
    }

    /// The topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

// ── SubscriptionRegistry ─────────────────────────────────────────

struct Entry {
    id: u64,
    accepted: HashSet<String>,
    callback: EventCallback,
}

impl Entry {
    fn accepts(&self, kind: &str) -> bool {
        self.accepted.contains(kind)
    }
}

/// Maps topics to their active subscriptions, in registration order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<String, Vec<Entry>>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and return its handle.
    pub fn subscribe(
        &mut self,
        topic: &str,
        accepted: impl IntoIterator<Item = String>,
        callback: EventCallback,
    ) -> SubscriptionHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.insert(topic, id, accepted, callback)
    }

    /// Register a subscription under a caller-allocated id. Used by the
    /// connection manager, whose consumers mint ids before the bus task
    /// sees the request.
    pub fn insert(
        &mut self,
        topic: &str,
        id: u64,
        accepted: impl IntoIterator<Item = String>,
        callback: EventCallback,
    ) -> SubscriptionHandle {
        self.topics.entry(topic.to_string()).or_default().push(Entry {
            id,
            accepted: accepted.into_iter().collect(),
            callback,
        });
        SubscriptionHandle::new(topic.to_string(), id)
    }

    /// Remove a subscription. A handle that no longer names a live
    /// subscription is a no-op.
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) {
        if let Some(entries) = self.topics.get_mut(&handle.topic) {
            entries.retain(|e| e.id != handle.id);
            if entries.is_empty() {
                self.topics.remove(&handle.topic);
            }
        }
    }

    /// Deliver a payload to every subscription on `topic` whose accepted
    /// set contains the payload's kind, in registration order.
    ///
    /// Callbacks returning [`Delivery::Stop`] are removed mid-pass without
    /// disturbing the rest of the traversal. Returns the number of
    /// callbacks invoked.
    pub fn deliver(&mut self, topic: &str, payload: &Payload) -> usize {
        let Some(entries) = self.topics.get_mut(topic) else {
            return 0;
        };

        let kind = payload.kind();
        let mut delivered = 0;
        entries.retain_mut(|entry| {
            if !entry.accepts(kind) {
                return true;
            }
            delivered += 1;
            match (entry.callback)(payload) {
                Delivery::Retain => true,
                Delivery::Stop => false,
            }
        });

        if entries.is_empty() {
            self.topics.remove(topic);
        }
        delivered
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (topic, entries) in &self.topics {
            map.entry(topic, &entries.len());
        }
        map.finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
