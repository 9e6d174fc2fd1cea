// commonkit-messaging-core/src/memory.rs
//! In-process broker backend.
//!
//! Follows the AMQP default-exchange rules the listener and publisher rely
//! on: queues are FIFO, redeclaring with different parameters is rejected,
//! messages routed to an unknown queue are dropped, and a queue serves a
//! single consumer at a time. A queue outlives its consumers, so messages
//! published while nobody listens wait for the next one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::debug;

use crate::broker::{BrokerConnection, Session};
use crate::types::{
    Confirmation, ConfirmationStream, DeliveryStream, OutboundMessage, QueueOptions,
};
use crate::MessagingError;

// Consumer tags start at 1
const NO_CONSUMER: u64 = 0;

struct MemoryQueue {
    options: QueueOptions,
    tx: mpsc::UnboundedSender<OutboundMessage>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<OutboundMessage>>>,
    consumer: Arc<AtomicU64>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    nack_publishes: bool,
    last_consumer_tag: u64,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> MemoryConnection {
        let (closed, _) = watch::channel(false);
        MemoryConnection {
            broker: self.clone(),
            closed: Arc::new(closed),
        }
    }

    /// Makes every later confirmation a nack.
    pub fn set_nack_publishes(&self, nack: bool) {
        self.lock().nack_publishes = nack;
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Removes and returns the messages waiting in `queue`. Empty when the
    /// queue does not exist or a consumer is attached.
    pub fn drain(&self, queue: &str) -> Vec<OutboundMessage> {
        let state = self.lock();
        let mut drained = Vec::new();
        let Some(entry) = state.queues.get(queue) else {
            return drained;
        };
        if entry.consumer.load(Ordering::Acquire) != NO_CONSUMER {
            return drained;
        }
        if let Ok(mut rx) = entry.rx.try_lock() {
            while let Ok(message) = rx.try_recv() {
                drained.push(message);
            }
        }
        drained
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Session = MemorySession;

    async fn open_session(&self) -> Result<MemorySession, MessagingError> {
        if *self.closed.borrow() {
            return Err(MessagingError::Connection("connection is closed".into()));
        }
        let (closed, _) = watch::channel(false);
        Ok(MemorySession {
            broker: self.broker.clone(),
            connection_closed: Arc::clone(&self.closed),
            closed,
            confirms: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(0),
        })
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

// A queue's consumer slot, held by the session that claimed it and by the
// delivery stream. Releasing only clears the slot if it still holds `tag`.
struct ConsumerSlot {
    consumer: Arc<AtomicU64>,
    tag: u64,
}

impl ConsumerSlot {
    fn release(&self) {
        let _ = self.consumer.compare_exchange(
            self.tag,
            NO_CONSUMER,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

struct ReleaseOnDrop(Arc<ConsumerSlot>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct Deliveries {
    queue: String,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<OutboundMessage>>>,
    session_closed: watch::Receiver<bool>,
    connection_closed: watch::Receiver<bool>,
    _slot: ReleaseOnDrop,
}

pub struct MemorySession {
    broker: MemoryBroker,
    connection_closed: Arc<watch::Sender<bool>>,
    closed: watch::Sender<bool>,
    confirms: Mutex<Option<mpsc::UnboundedSender<Confirmation>>>,
    consumers: Mutex<Vec<Arc<ConsumerSlot>>>,
    next_tag: AtomicU64,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), MessagingError> {
        if *self.closed.borrow() {
            return Err(MessagingError::Channel("session is closed".into()));
        }
        if *self.connection_closed.borrow() {
            return Err(MessagingError::Channel("connection is closed".into()));
        }
        Ok(())
    }

    fn confirms(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Confirmation>>> {
        self.confirms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn consumers(&self) -> MutexGuard<'_, Vec<Arc<ConsumerSlot>>> {
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("closed", &*self.closed.borrow())
            .field("connection_closed", &*self.connection_closed.borrow())
            .finish_non_exhaustive()
    }
}

// Resolves once the flag is raised or its sender is gone.
async fn raised(rx: &mut watch::Receiver<bool>) {
    loop {
        let raised = *rx.borrow_and_update();
        if raised || rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.queues.get(queue) {
            Some(existing) if existing.options != options => Err(MessagingError::Channel(
                format!("PRECONDITION_FAILED - inequivalent arguments for queue '{queue}'"),
            )),
            Some(_) => Ok(()),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.queues.insert(
                    queue.to_string(),
                    MemoryQueue {
                        options,
                        tx,
                        rx: Arc::new(AsyncMutex::new(rx)),
                        consumer: Arc::new(AtomicU64::new(NO_CONSUMER)),
                    },
                );
                Ok(())
            }
        }
    }

    async fn enable_confirms(&self) -> Result<ConfirmationStream, MessagingError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.confirms() = Some(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|confirm| (confirm, rx))
        })
        .boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;

        let ack = {
            let state = self.broker.lock();
            match state.queues.get(routing_key) {
                // The queue owns both ends, so the send cannot fail
                Some(queue) => {
                    let _ = queue.tx.send(message);
                }
                None => debug!("unroutable message dropped. routing_key={}", routing_key),
            }
            !state.nack_publishes
        };

        if let Some(tx) = self.confirms().as_ref() {
            let delivery_tag = self.next_tag.fetch_add(1, Ordering::AcqRel) + 1;
            let _ = tx.send(Confirmation { delivery_tag, ack });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, MessagingError> {
        self.ensure_open()?;
        let (slot, rx) = {
            let mut state = self.broker.lock();
            state.last_consumer_tag += 1;
            let tag = state.last_consumer_tag;

            let entry = state.queues.get(queue).ok_or_else(|| {
                MessagingError::Channel(format!("NOT_FOUND - no queue '{queue}'"))
            })?;
            entry
                .consumer
                .compare_exchange(NO_CONSUMER, tag, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| {
                    MessagingError::Channel(format!("queue '{queue}' already has a consumer"))
                })?;

            let slot = Arc::new(ConsumerSlot {
                consumer: Arc::clone(&entry.consumer),
                tag,
            });
            (slot, Arc::clone(&entry.rx))
        };
        self.consumers().push(Arc::clone(&slot));

        let deliveries = Deliveries {
            queue: queue.to_string(),
            rx,
            session_closed: self.closed.subscribe(),
            connection_closed: self.connection_closed.subscribe(),
            _slot: ReleaseOnDrop(slot),
        };

        Ok(stream::unfold(deliveries, |mut d| async move {
            let next = {
                let mut rx = d.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = raised(&mut d.session_closed) => None,
                    _ = raised(&mut d.connection_closed) => None,
                    message = rx.recv() => message,
                }
            };
            match next {
                Some(message) => Some((Ok::<_, MessagingError>(message.body), d)),
                None => {
                    debug!("consumer stopped. queue={}", d.queue);
                    None
                }
            }
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.closed.send_replace(true) {
            self.confirms().take();
            for slot in self.consumers().drain(..) {
                slot.release();
            }
        }
        Ok(())
    }
}
