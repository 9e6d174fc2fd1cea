// commonkit-messaging-core/src/listener.rs
//! Typed queue consumer.
//!
//! A [`Listener`] goes through three states:
//!
//! ```text
//! Idle --listen()--> Receiving --close() / stream end--> Closed
//!   \------------------close()-------------------------->/
//! ```
//!
//! Deliveries are auto-acknowledged, so a message whose body cannot be
//! decoded or whose handler fails is logged and dropped, never redelivered.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnection, Session};
use crate::queue::declare_queue;
use crate::types::DeliveryStream;
use crate::{MessageHandler, MessagingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Receiving,
    Closed,
}

struct Inner<B: Send + Sync + 'static> {
    state: ListenerState,
    handler: Option<Arc<dyn MessageHandler<B>>>,
}

pub struct Listener<S: Session, B: Send + Sync + 'static> {
    session: S,
    topic: String,
    inner: Mutex<Inner<B>>,
    shutdown: watch::Sender<bool>,
    _body: PhantomData<fn() -> B>,
}

impl<S, B> Listener<S, B>
where
    S: Session,
    B: DeserializeOwned + Send + Sync + 'static,
{
    pub async fn new<C>(connection: &C, topic: &str) -> Result<Self, MessagingError>
    where
        C: BrokerConnection<Session = S>,
    {
        let session = declare_queue(connection, topic)
            .await
            .map_err(|e| MessagingError::ListenerInit(Box::new(e)))?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            session,
            topic: topic.to_string(),
            inner: Mutex::new(Inner {
                state: ListenerState::Idle,
                handler: None,
            }),
            shutdown,
            _body: PhantomData,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ListenerState {
        self.lock().state
    }

    /// Registers the per-message handler, replacing any previous one.
    /// Rejected once [`Listener::listen`] has been called.
    pub fn assign_handler<H>(&self, handler: H) -> Result<(), MessagingError>
    where
        H: MessageHandler<B> + 'static,
    {
        let mut inner = self.lock();
        if inner.state != ListenerState::Idle {
            return Err(MessagingError::HandlerAfterStart);
        }
        inner.handler = Some(Arc::new(handler));
        Ok(())
    }

    /// Consumes the queue until [`Listener::close`] is called or the broker
    /// ends the delivery stream.
    pub async fn listen(&self) -> Result<(), MessagingError> {
        let handler = {
            let mut inner = self.lock();
            match inner.state {
                ListenerState::Idle => {}
                ListenerState::Receiving => return Err(MessagingError::AlreadyListening),
                ListenerState::Closed => return Err(MessagingError::ListenerClosed),
            }
            let handler = inner.handler.clone().ok_or(MessagingError::MissingHandler)?;
            inner.state = ListenerState::Receiving;
            handler
        };

        let stream = match self.session.consume(&self.topic).await {
            Ok(stream) => stream,
            Err(e) => {
                // A close() that raced the subscription still wins
                let stopping = *self.shutdown.borrow();
                self.lock().state = if stopping {
                    ListenerState::Closed
                } else {
                    ListenerState::Idle
                };
                if stopping {
                    if let Err(e) = self.session.close().await {
                        warn!("closing listener session failed: {}, queue={}", e, self.topic);
                    }
                }
                return Err(MessagingError::Subscribe(e.to_string()));
            }
        };

        info!("consuming queue={}", self.topic);

        let mut stop = self.shutdown.subscribe();
        let mut task = tokio::spawn(receive(
            self.topic.clone(),
            stream,
            handler,
            self.shutdown.subscribe(),
        ));

        tokio::select! {
            _ = stopped(&mut stop) => {
                debug!("shutdown requested. queue={}", self.topic);
                if let Err(e) = (&mut task).await {
                    error!("receive task failed: {}, queue={}", e, self.topic);
                }
            }
            joined = &mut task => {
                if let Err(e) = joined {
                    error!("receive task failed: {}, queue={}", e, self.topic);
                }
            }
        }

        self.lock().state = ListenerState::Closed;
        if let Err(e) = self.session.close().await {
            warn!("closing listener session failed: {}, queue={}", e, self.topic);
        }
        info!("listener stopped. queue={}", self.topic);
        Ok(())
    }

    /// Signals shutdown. A pending [`Listener::listen`] returns after the
    /// message in flight is handled; an idle listener is closed right away.
    pub async fn close(&self) -> Result<(), MessagingError> {
        self.shutdown.send_replace(true);

        let was_idle = {
            let mut inner = self.lock();
            let was_idle = inner.state == ListenerState::Idle;
            if was_idle {
                inner.state = ListenerState::Closed;
            }
            was_idle
        };

        if was_idle {
            self.session.close().await?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Resolves once shutdown is latched or the listener is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}

async fn receive<B>(
    topic: String,
    mut stream: DeliveryStream,
    handler: Arc<dyn MessageHandler<B>>,
    mut stop: watch::Receiver<bool>,
) where
    B: DeserializeOwned + Send + Sync + 'static,
{
    loop {
        let delivery = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            next = stream.next() => next,
        };

        let data = match delivery {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                error!("delivery error: {}, queue={}", e, topic);
                break;
            }
            None => {
                info!("delivery stream ended. queue={}", topic);
                break;
            }
        };

        let body: B = match serde_json::from_slice(&data) {
            Ok(body) => body,
            Err(e) => {
                error!("cannot decode message: {}, queue={}", e, topic);
                continue;
            }
        };

        if let Err(e) = handler.handle(&body).await {
            error!("handler error: {}, queue={}", e, topic);
        }
    }
}
