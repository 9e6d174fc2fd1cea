// commonkit-messaging-core/src/broker.rs
use async_trait::async_trait;

use crate::types::{ConfirmationStream, DeliveryStream, OutboundMessage, QueueOptions};
use crate::MessagingError;

/// A single authenticated link to a broker.
///
/// Sessions opened from a connection stop working once it is closed.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    type Session: Session;

    async fn open_session(&self) -> Result<Self::Session, MessagingError>;

    /// Releases the link. Closing twice is a no-op.
    async fn close(&self) -> Result<(), MessagingError>;
}

/// A channel multiplexed over a [`BrokerConnection`], owned by exactly one
/// publisher or listener.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Declares `queue`; identical redeclaration succeeds, conflicting
    /// parameters are rejected.
    async fn declare_queue(&self, queue: &str, options: QueueOptions)
        -> Result<(), MessagingError>;

    /// Puts the session in confirm mode and returns the confirmation stream
    /// for every message published afterwards.
    async fn enable_confirms(&self) -> Result<ConfirmationStream, MessagingError>;

    /// Hands `message` to the default exchange with `routing_key`. Returns
    /// before any broker confirmation.
    async fn publish(&self, routing_key: &str, message: OutboundMessage)
        -> Result<(), MessagingError>;

    /// Starts an auto-acknowledging consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}
