//! Synchronous event fan-out
//!
//! Components publish lifecycle events through an [`EventBus`]. Handlers are
//! invoked inline on the emitting task, in registration order; subscribers
//! receive a copy through an unbounded channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Type for event handlers
pub type EventHandler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`EventBus::add_handler`], used to remove the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct BusInner<E> {
    handlers: Mutex<Vec<(HandlerId, EventHandler<E>)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
    next_id: AtomicU64,
}

/// Cloneable handle to a shared set of handlers and subscribers
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Add an event handler
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.handlers).push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Receive every subsequent event on a channel
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// Emit an event to all handlers and live subscribers
    pub fn emit(&self, event: E) {
        let handlers: Vec<EventHandler<E>> = lock(&self.inner.handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }

        lock(&self.inner.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every handler and subscriber
    pub fn clear(&self) {
        lock(&self.inner.handlers).clear();
        lock(&self.inner.subscribers).clear();
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.inner.handlers).len()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &lock(&self.inner.handlers).len())
            .field("subscribers", &lock(&self.inner.subscribers).len())
            .finish()
    }
}
