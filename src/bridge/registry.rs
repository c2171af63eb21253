//! Listener subscriptions keyed by (capability, property)

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::queue::QueueProducer;
use crate::host::CapabilityId;

/// Consumer-chosen subscription id
pub type ListenerId = u64;

/// Session that added a subscription
pub type OwnerId = u64;

/// Callback run on the scheduler task when a watched property changes
pub type ListenerCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Unit of deferred work, consumed exactly once by the next tick
pub type Deferred = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct Subscription {
    owner: OwnerId,
    id: ListenerId,
    callback: ListenerCallback,
}

/// Ordered subscriptions per key
///
/// Insertion order is delivery order. A key never maps to an empty list.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<(CapabilityId, String), Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscription; duplicates are kept and both fire
    pub fn add(
        &mut self,
        owner: OwnerId,
        target: CapabilityId,
        property: &str,
        id: ListenerId,
        callback: ListenerCallback,
    ) {
        self.entries
            .entry((target, property.to_string()))
            .or_default()
            .push(Subscription {
                owner,
                id,
                callback,
            });
    }

    /// Remove every subscription with this id; returns how many were removed
    pub fn remove(&mut self, target: CapabilityId, property: &str, id: ListenerId) -> usize {
        let key = (target, property.to_string());
        let Some(list) = self.entries.get_mut(&key) else {
            return 0;
        };

        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = before - list.len();

        if list.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Remove everything one owner added, across all keys
    pub fn remove_owner(&mut self, owner: OwnerId) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.owner != owner);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Enqueue each subscription's callback, in insertion order
    pub fn fire(&self, target: CapabilityId, property: &str, sink: &QueueProducer<Deferred>) -> usize {
        let Some(list) = self.entries.get(&(target, property.to_string())) else {
            return 0;
        };

        for sub in list {
            let callback = sub.callback.clone();
            sink.push(Box::new(move || callback()));
        }
        trace!(%target, property, count = list.len(), "Listeners fired");
        list.len()
    }

    /// Subscription ids for a key, in delivery order
    pub fn ids(&self, target: CapabilityId, property: &str) -> Vec<ListenerId> {
        self.entries
            .get(&(target, property.to_string()))
            .map(|list| list.iter().map(|s| s.id).collect())
            .unwrap_or_default()
    }

    /// Number of keys with at least one subscription
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

/// Registry shared between host threads (fire) and RPC tasks (add/remove)
#[derive(Clone, Default)]
pub struct SharedRegistry {
    inner: Arc<RwLock<SubscriptionRegistry>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        owner: OwnerId,
        target: CapabilityId,
        property: &str,
        id: ListenerId,
        callback: ListenerCallback,
    ) {
        self.inner.write().add(owner, target, property, id, callback);
        debug!(%target, property, id, owner, "Listener added");
    }

    pub fn remove(&self, target: CapabilityId, property: &str, id: ListenerId) -> usize {
        let removed = self.inner.write().remove(target, property, id);
        debug!(%target, property, id, removed, "Listener removed");
        removed
    }

    pub fn remove_owner(&self, owner: OwnerId) -> usize {
        let removed = self.inner.write().remove_owner(owner);
        debug!(owner, removed, "Owner's listeners removed");
        removed
    }

    pub fn fire(&self, target: CapabilityId, property: &str, sink: &QueueProducer<Deferred>) -> usize {
        self.inner.read().fire(target, property, sink)
    }

    pub fn ids(&self, target: CapabilityId, property: &str) -> Vec<ListenerId> {
        self.inner.read().ids(target, property)
    }

    pub fn key_count(&self) -> usize {
        self.inner.read().key_count()
    }
}
