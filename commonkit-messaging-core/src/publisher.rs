// commonkit-messaging-core/src/publisher.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnection, Session};
use crate::queue::declare_queue;
use crate::types::{ConfirmationStream, OutboundMessage};
use crate::{MessagingError, Topic};

/// Sends topics to a durable queue. Broker confirmations are only logged,
/// they never change the outcome of [`Publisher::publish`].
pub struct Publisher<S: Session> {
    session: S,
    queue: String,
    confirms: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<S: Session> Publisher<S> {
    pub async fn new<C>(connection: &C, topic: &str) -> Result<Self, MessagingError>
    where
        C: BrokerConnection<Session = S>,
    {
        let session = declare_queue(connection, topic)
            .await
            .map_err(|e| MessagingError::PublisherInit(Box::new(e)))?;

        let stream = match session.enable_confirms().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = session.close().await;
                return Err(MessagingError::PublisherInit(Box::new(e)));
            }
        };

        let handle = tokio::spawn(drain_confirmations(topic.to_string(), stream));
        info!("publisher ready. queue={}", topic);

        Ok(Self {
            session,
            queue: topic.to_string(),
            confirms: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Fire and forget: returns once the client took the message.
    pub async fn publish<T>(&self, topic: &T) -> Result<(), MessagingError>
    where
        T: Topic + ?Sized,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Publish("publisher is closed".into()));
        }

        let routing_key = topic.topic_name();
        if routing_key != self.queue {
            warn!(
                "publishing to a queue this publisher did not declare. declared={} routing_key={}",
                self.queue, routing_key
            );
        }

        let message = OutboundMessage::persistent_text(topic.body()?);
        let id = message.id;
        self.session
            .publish(routing_key, message)
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        debug!("message handed to broker. id={} routing_key={}", id, routing_key);
        Ok(())
    }

    /// Closes the session and stops confirmation tracking. Safe to call
    /// more than once.
    pub async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.session.close().await;

        let handle = self
            .confirms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        info!("publisher closed. queue={}", self.queue);
        result
    }
}

impl<S: Session> Drop for Publisher<S> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .confirms
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

async fn drain_confirmations(queue: String, mut stream: ConfirmationStream) {
    while let Some(confirm) = stream.next().await {
        if confirm.ack {
            info!(
                "message published successfully. queue={} delivery_tag={}",
                queue, confirm.delivery_tag
            );
        } else {
            error!(
                "failed to publish message. queue={} delivery_tag={}",
                queue, confirm.delivery_tag
            );
        }
    }
    debug!("confirmation stream ended. queue={}", queue);
}
