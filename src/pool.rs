//! Broadcast pool
//!
//! A registry of subscriber callbacks fanned out to on every update. Viewers
//! register when they connect and must delete their subscriber when their
//! transport fails; the pool never expires entries on its own.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Identifier of a pool subscriber, unique for the lifetime of its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry of callbacks notified with every broadcast value.
///
/// Callbacks run synchronously on the caller of [`BroadcastPool::update`] and
/// must not call back into the same pool. A slow callback delays the ones
/// after it, so transports should hand the value off (e.g. to a channel)
/// rather than write inline.
pub struct BroadcastPool<T> {
    name: String,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, Callback<T>>>,
}

impl<T> BroadcastPool<T> {
    /// Create a named pool. The name is only used in log output.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback and return its handle
    pub fn create<F>(self: &Arc<Self>, on_update: F) -> Subscriber<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().insert(id, Box::new(on_update));
        tracing::debug!("{} pool: created subscriber {}", self.name, id);

        Subscriber {
            id,
            pool: Arc::downgrade(self),
        }
    }

    /// Invoke every registered callback with `value`.
    ///
    /// Runs under the registry read lock, so once [`BroadcastPool::delete`]
    /// returns the deleted callback is never invoked again.
    pub fn update(&self, value: &T) {
        let subscribers = self.subscribers.read();
        for callback in subscribers.values() {
            callback(value);
        }
    }

    /// Remove a subscriber. Unknown or already-removed ids are ignored.
    pub fn delete(&self, id: SubscriberId) {
        if self.subscribers.write().remove(&id).is_some() {
            tracing::debug!("{} pool: deleted subscriber {}", self.name, id);
        }
    }

    /// Number of registered subscribers
    pub fn count(&self) -> usize {
        self.subscribers.read_recursive().len()
    }

    /// Log the current subscriber count
    pub fn log_count(&self) {
        tracing::info!("{} pool has {} subscriber(s)", self.name, self.count());
    }
}

impl<T> fmt::Debug for BroadcastPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastPool")
            .field("name", &self.name)
            .field("subscribers", &self.count())
            .finish()
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle does not unregister; call [`Subscriber::delete`].
pub struct Subscriber<T> {
    id: SubscriberId,
    pool: Weak<BroadcastPool<T>>,
}

impl<T> Subscriber<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove this subscriber from its pool. Safe to call more than once,
    /// and after the pool itself is gone.
    pub fn delete(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.delete(self.id);
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}
