//! In-process publish/subscribe fan-out.
//!
//! [`EventBus`] multiplexes a single producer to any number of independent
//! listeners. Each listener owns its own FIFO queue, so a slow consumer never
//! stalls the producer or its siblings. The bus is how the single decoded
//! line stream coming off the serial port is shared between concurrent
//! driver operations.
//!
//! Completion is terminal: once [`EventBus::complete`] has run, current and
//! future subscriptions observe end-of-stream, with the fault (if any)
//! surfacing from [`Subscription::recv`].

use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error surfaced to listeners of a bus that completed with a fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("subscription faulted: {0}")]
    Faulted(String),
}

enum QueueSender<T> {
    Unbounded(mpsc::UnboundedSender<T>),
    Bounded(mpsc::Sender<T>),
}

enum QueueReceiver<T> {
    Unbounded(mpsc::UnboundedReceiver<T>),
    Bounded(mpsc::Receiver<T>),
}

struct Listener<T> {
    id: u64,
    queue: QueueSender<T>,
}

struct BusInner<T> {
    next_id: u64,
    listeners: Vec<Listener<T>>,
    /// `Some` once the bus is terminal; the inner value is the fault, if any.
    completed: Option<Option<String>>,
}

/// One-producer many-listener broadcast bus with per-listener queues.
pub struct EventBus<T> {
    inner: Arc<Mutex<BusInner<T>>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                listeners: Vec::new(),
                completed: None,
            })),
        }
    }

    /// Register a new listener with an unbounded queue.
    ///
    /// Subscribing to a completed bus yields a subscription that observes
    /// end-of-stream (and the fault, if any) immediately.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
    }

    /// Register a new listener with a bounded queue; messages published while
    /// the queue is full are dropped for this listener only.
    pub fn subscribe_bounded(&self, capacity: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(capacity);
        self.register(QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
    }

    fn register(&self, tx: QueueSender<T>, rx: QueueReceiver<T>) -> Subscription<T> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.completed.is_none() {
            inner.listeners.push(Listener { id, queue: tx });
        }
        // On a completed bus the sender is dropped right here, so the new
        // subscription sees end-of-stream on its first read.
        trace!("bus listener {id} registered");
        Subscription {
            id,
            queue: rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Deliver a message to every currently-registered listener.
    ///
    /// Never blocks: a bounded listener whose queue is full misses this
    /// message (logged), everyone else still receives it.
    pub fn publish(&self, message: T)
    where
        T: Clone,
    {
        let inner = self.lock();
        if inner.completed.is_some() {
            warn!("message published to a completed bus, dropping it");
            return;
        }
        for listener in &inner.listeners {
            match &listener.queue {
                QueueSender::Unbounded(tx) => {
                    if tx.send(message.clone()).is_err() {
                        warn!("listener {} queue is closed", listener.id);
                    }
                }
                QueueSender::Bounded(tx) => match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("listener {} can't keep up, dropping message", listener.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!("listener {} queue is closed", listener.id);
                    }
                },
            }
        }
    }

    /// Mark the bus terminal, optionally with a fault.
    ///
    /// Every registered listener observes end-of-stream once its queue
    /// drains; future subscribers observe it immediately. Completing an
    /// already-completed bus is a logged no-op.
    pub fn complete(&self, fault: Option<String>) {
        let mut inner = self.lock();
        if inner.completed.is_some() {
            debug!("bus was already completed");
            return;
        }
        match &fault {
            Some(fault) => warn!("bus completed with fault: {fault}"),
            None => debug!("bus completed"),
        }
        inner.completed = Some(fault);
        // Dropping the senders is what wakes the listeners with end-of-stream.
        inner.listeners.clear();
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed.is_some()
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A live registration on an [`EventBus`]. Dropping it deregisters the
/// listener and closes its queue.
pub struct Subscription<T> {
    id: u64,
    queue: QueueReceiver<T>,
    inner: Arc<Mutex<BusInner<T>>>,
}

impl<T> Subscription<T> {
    /// Receive the next message.
    ///
    /// `Ok(None)` means the bus completed normally; a fault completion
    /// surfaces as `Err(BusError::Faulted)`.
    pub async fn recv(&mut self) -> Result<Option<T>, BusError> {
        let next = match &mut self.queue {
            QueueReceiver::Unbounded(rx) => rx.recv().await,
            QueueReceiver::Bounded(rx) => rx.recv().await,
        };
        match next {
            Some(message) => Ok(Some(message)),
            None => {
                let inner = match self.inner.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match &inner.completed {
                    Some(Some(fault)) => Err(BusError::Faulted(fault.clone())),
                    _ => Ok(None),
                }
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.listeners.retain(|listener| listener.id != self.id);
            trace!("bus listener {} deregistered", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_delivers_to_every_listener() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish("POS 5".to_string());

        assert_eq!(first.recv().await.unwrap(), Some("POS 5".to_string()));
        assert_eq!(second.recv().await.unwrap(), Some("POS 5".to_string()));
    }

    #[tokio::test]
    async fn test_listener_queues_are_fifo() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        for n in 0..5 {
            bus.publish(n);
        }
        for n in 0..5 {
            assert_eq!(sub.recv().await.unwrap(), Some(n));
        }
    }

    #[tokio::test]
    async fn test_drop_deregisters_listener() {
        let bus = EventBus::<i32>::new();
        let sub = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);
        drop(sub);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_messages_before_subscribe_are_not_replayed() {
        let bus = EventBus::new();
        bus.publish(1);
        let mut sub = bus.subscribe();
        bus.publish(2);
        bus.complete(None);

        assert_eq!(sub.recv().await.unwrap(), Some(2));
        assert_eq!(sub.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_complete_with_fault_surfaces_to_listeners() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish("OK".to_string());
        bus.complete(Some("port went away".to_string()));

        // Buffered messages drain first, then the fault shows up.
        assert_eq!(sub.recv().await.unwrap(), Some("OK".to_string()));
        assert_eq!(
            sub.recv().await,
            Err(BusError::Faulted("port went away".to_string()))
        );
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let bus = EventBus::<String>::new();
        bus.complete(None);
        bus.complete(Some("late fault".to_string()));

        // The second completion is ignored, so a new subscriber sees a
        // normal end-of-stream.
        let mut sub = bus.subscribe();
        assert_eq!(sub.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_after_completion_observes_end_of_stream() {
        let bus = EventBus::<String>::new();
        bus.complete(Some("gone".to_string()));

        let mut sub = bus.subscribe();
        assert_eq!(sub.recv().await, Err(BusError::Faulted("gone".to_string())));
    }

    #[tokio::test]
    async fn test_bounded_listener_drops_when_full() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe_bounded(2);
        let mut fast = bus.subscribe();

        for n in 0..4 {
            bus.publish(n);
        }
        bus.complete(None);

        // The slow listener kept only what fit in its queue.
        assert_eq!(slow.recv().await.unwrap(), Some(0));
        assert_eq!(slow.recv().await.unwrap(), Some(1));
        assert_eq!(slow.recv().await.unwrap(), None);

        // The unbounded listener saw everything.
        for n in 0..4 {
            assert_eq!(fast.recv().await.unwrap(), Some(n));
        }
        assert_eq!(fast.recv().await.unwrap(), None);
    }
}
