//! Publish/subscribe registry for asynchronous notifications.
//!
//! Handlers run synchronously on the task that emits the event, in
//! registration order, so they should return quickly. A handler may subscribe
//! or unsubscribe (itself included) while running: emission iterates over a
//! snapshot taken before the first handler is called.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tracing::error;

/// Returned by [`EventRegistry::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

pub struct EventRegistry<E> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push((id, Arc::new(handler)));
        }
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.handlers.lock() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(sid, _)| *sid != id);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = match self.handlers.lock() {
            Ok(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            Err(_) => return,
        };
        for handler in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("event handler panicked, skipped");
            }
        }
    }
}
