//! In-process publish/subscribe for notification events.
//!
//! Every subscription hands back a [`Subscription`] guard. Dropping the guard
//! (or calling [`Subscription::unsubscribe`]) removes the callback, so a
//! consumer that goes away on any path, including a cancelled task, can never
//! be called again afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::protocol::{NotificationEvent, NotificationKind};

type Callback = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<NotificationKind, Vec<(u64, Callback)>>>,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<NotificationKind, Vec<(u64, Callback)>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, kind: NotificationKind, id: u64) -> bool {
        let mut guard = self.lock();
        let Some(list) = guard.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            guard.remove(&kind);
        }
        removed
    }
}

/// Broadcast bus keyed by notification kind. Cloning shares the same bus.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every published event of `kind`.
    pub fn subscribe<F>(&self, kind: NotificationKind, callback: F) -> Subscription
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(kind = kind.as_str(), id, "notification subscriber added");
        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
            active: true,
        }
    }

    /// Delivers `event` to every current subscriber of its kind and returns
    /// how many callbacks ran. Callbacks run outside the registry lock so they
    /// may subscribe or unsubscribe themselves.
    pub fn publish(&self, event: &NotificationEvent) -> usize {
        let callbacks: Vec<Callback> = match self.inner.lock().get(&event.kind) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => Vec::new(),
        };
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, kind: NotificationKind) -> usize {
        self.inner.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }
}

/// Disposer for one bus registration.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: NotificationKind,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    /// Removes the callback. Returns `false` if the bus is already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.detach()
    }

    fn detach(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.kind, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
