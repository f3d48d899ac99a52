//! Resolving queue ids back to live queues.
//!
//! A transport that only carries a [`QueueId`] across a process boundary uses a
//! [`QueueRegistry`] to find the in-process queue again. The registry stores `Weak`
//! references: the endpoints own the queue, and an entry whose queue has been dropped
//! simply stops resolving.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::queue::{BufferQueue, QueueId};

/// Explicit id-to-queue registry service.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<QueueId, Weak<BufferQueue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `queue` under its id and returns the id.
    pub fn add(&self, queue: &Arc<BufferQueue>) -> QueueId {
        let id = queue.id();
        self.queues.write().insert(id, Arc::downgrade(queue));
        tracing::debug!(queue = %queue.name(), %id, "Queue registered");
        id
    }

    /// Removes the entry for `id`. Returns `false` if there was none.
    pub fn remove(&self, id: QueueId) -> bool {
        self.queues.write().remove(&id).is_some()
    }

    /// Resolves `id` to its queue, dropping the entry if the queue is gone.
    pub fn lookup(&self, id: QueueId) -> Option<Arc<BufferQueue>> {
        let queue = self.queues.read().get(&id).and_then(Weak::upgrade);
        if queue.is_none() && self.queues.write().remove(&id).is_some() {
            tracing::debug!(%id, "Pruned dropped queue from registry");
        }
        queue
    }

    /// Number of live queues. Dead entries are pruned first.
    pub fn len(&self) -> usize {
        let mut queues = self.queues.write();
        queues.retain(|_, queue| queue.strong_count() > 0);
        queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novade_buffer_manager::BufferManager;

    #[test]
    fn test_add_lookup_remove() {
        let registry = QueueRegistry::new();
        let (producer, _consumer) = BufferQueue::create("registered", Arc::new(BufferManager::new()));

        let id = registry.add(producer.queue());
        let found = registry.lookup(id).expect("queue should resolve");
        assert!(Arc::ptr_eq(&found, producer.queue()));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.lookup(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_does_not_keep_queue_alive() {
        let registry = QueueRegistry::new();
        let (producer, consumer) = BufferQueue::create("short-lived", Arc::new(BufferManager::new()));
        let id = registry.add(producer.queue());

        drop(producer);
        drop(consumer);
        assert!(registry.lookup(id).is_none(), "Dropped queue must not resolve.");
        assert_eq!(registry.len(), 0);
    }
}
