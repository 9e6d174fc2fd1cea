// commonkit-messaging-core/src/types.rs
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::MessagingError;

/// Content type stamped on every published message.
pub const TEXT_PLAIN: &str = "text/plain";

/// Stream of raw delivery bodies coming from a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Vec<u8>, MessagingError>>;

/// Stream of broker confirmations for a session in confirm mode.
pub type ConfirmationStream = BoxStream<'static, Confirmation>;

/// Message as handed to a session for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub body: Vec<u8>,
    pub content_type: String,
    /// Survives a broker restart (AMQP delivery mode 2).
    pub persistent: bool,
    pub sent_at_utc: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn persistent_text(body: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            content_type: TEXT_PLAIN.to_string(),
            persistent: true,
            sent_at_utc: Utc::now(),
        }
    }
}

/// Broker verdict on a previously published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared, kept after the last consumer leaves.
    pub const fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable()
    }
}
