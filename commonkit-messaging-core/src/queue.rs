// commonkit-messaging-core/src/queue.rs
use tracing::debug;

use crate::broker::{BrokerConnection, Session};
use crate::types::QueueOptions;
use crate::MessagingError;

/// Opens a session on `connection` and declares a durable queue named
/// `topic` on it. Publishers and listeners both go through here so they
/// always agree on the queue parameters.
pub async fn declare_queue<C>(connection: &C, topic: &str) -> Result<C::Session, MessagingError>
where
    C: BrokerConnection,
{
    if topic.is_empty() {
        return Err(MessagingError::QueueDeclare("topic name is empty".into()));
    }

    let session = connection
        .open_session()
        .await
        .map_err(|e| MessagingError::QueueDeclare(e.to_string()))?;

    if let Err(e) = session.declare_queue(topic, QueueOptions::durable()).await {
        let _ = session.close().await;
        return Err(MessagingError::QueueDeclare(e.to_string()));
    }

    debug!("queue declared. queue={}", topic);
    Ok(session)
}
