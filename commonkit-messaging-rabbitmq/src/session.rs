use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use lapin::{
    options::*, publisher_confirm::PublisherConfirm, types::FieldTable, BasicProperties, Channel,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use commonkit_messaging_core::types::{ConfirmationStream, DeliveryStream};
use commonkit_messaging_core::{Confirmation, MessagingError, OutboundMessage, QueueOptions, Session};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

type PendingConfirm = (u64, PublisherConfirm);

/// A lapin channel owned by one publisher or listener.
pub struct RabbitSession {
    channel: Channel,
    confirms: Mutex<Option<mpsc::UnboundedSender<PendingConfirm>>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl RabbitSession {
    pub(crate) fn new(channel: Channel) -> Self {
        Self {
            channel,
            confirms: Mutex::new(None),
            next_tag: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::Acquire) || !self.channel.status().connected() {
            return Err(MessagingError::Channel(format!(
                "channel {} is closed",
                self.channel.id()
            )));
        }
        Ok(())
    }

    fn confirm_sender(&self) -> Option<mpsc::UnboundedSender<PendingConfirm>> {
        self.confirms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Session for RabbitSession {
    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))?;
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<ConfirmationStream, MessagingError> {
        self.ensure_open()?;
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel::<PendingConfirm>();
        *self
            .confirms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);

        // Confirms are awaited in publish order, matching the broker's.
        Ok(stream::unfold(rx, |mut rx| async move {
            let (delivery_tag, pending) = rx.recv().await?;
            let ack = match pending.await {
                Ok(confirmation) => confirmation.is_ack(),
                Err(e) => {
                    warn!("confirmation lost: {}, delivery_tag={}", e, delivery_tag);
                    false
                }
            };
            Some((Confirmation { delivery_tag, ack }, rx))
        })
        .boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;

        let mut properties = BasicProperties::default()
            .with_content_type(message.content_type.as_str().into())
            .with_message_id(message.id.to_string().into())
            .with_timestamp(message.sent_at_utc.timestamp().max(0) as u64);
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &message.body,
                properties,
            )
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))?;

        if let Some(tx) = self.confirm_sender() {
            let delivery_tag = self.next_tag.fetch_add(1, Ordering::AcqRel) + 1;
            if tx.send((delivery_tag, confirm)).is_err() {
                debug!("confirmation tracking stopped, dropping confirm. delivery_tag={}", delivery_tag);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, MessagingError> {
        self.ensure_open()?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| d.data)
                    .map_err(|e| MessagingError::Channel(e.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.confirms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }
}
