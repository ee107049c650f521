//! Fan-out of session events to independent subscribers.
//!
//! Every subscriber owns a bounded channel. Delivery is a non-blocking
//! `try_send`, so a slow or vanished reader can never stall the emitter or
//! the other readers; it is dropped instead and its stream ends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::events::SessionEvent;

/// Default per-subscriber queue length.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

struct Subscriber {
    task_filter: Option<String>,
    tx: mpsc::Sender<SessionEvent>,
}

impl Subscriber {
    fn wants(&self, event: &SessionEvent) -> bool {
        self.task_filter
            .as_deref()
            .is_none_or(|task_id| task_id == event.task_id())
    }
}

struct Registry {
    next_id: AtomicU64,
    buffer: usize,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl Registry {
    fn remove(&self, id: u64) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }
}

/// Delivers every emitted event to every current subscriber, in emission order.
#[derive(Clone)]
pub struct EventBroadcaster {
    registry: Arc<Registry>,
}

impl EventBroadcaster {
    /// Create a broadcaster whose subscribers each queue up to `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a subscriber. Only events emitted after this call reach it.
    pub fn subscribe(&self, task_filter: Option<String>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.registry.buffer);
        self.registry
            .subscribers
            .lock()
            .insert(id, Subscriber { task_filter, tx });
        debug!(subscriber = id, "subscriber registered");

        Subscription {
            id,
            rx: ReceiverStream::new(rx),
            registry: Arc::downgrade(&self.registry),
            registered: true,
        }
    }

    /// Deliver `event` to every interested subscriber.
    ///
    /// Subscribers whose queue is full or whose receiver is gone are dropped.
    /// Returns the number of subscribers the event was queued for.
    pub fn emit(&self, event: &SessionEvent) -> usize {
        let mut subscribers = self.registry.subscribers.lock();
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.wants(event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "subscriber lagging, dropping it");
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = id, "subscriber gone");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            subscribers.remove(&id);
        }
        delivered
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.lock().len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

/// A live registration with an [`EventBroadcaster`].
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: ReceiverStream<SessionEvent>,
    registry: Weak<Registry>,
    registered: bool,
}

impl Subscription {
    /// Subscriber id, unique per broadcaster.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Next event. `None` once unsubscribed (or dropped for lagging) and drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.as_mut().recv().await
    }

    /// Stop receiving new events. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                debug!(subscriber = self.id, "subscriber removed");
            }
        }
        self.rx.close();
    }
}

impl Stream for Subscription {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
