use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::RwLock;
use tracing::info;

use crate::options::RabbitMqOptions;
use crate::session::RabbitSession;
use commonkit_messaging_core::{BrokerConnection, MessagingError};

const REPLY_SUCCESS: u16 = 200;

/// One authenticated AMQP link. Publishers and listeners each open their own
/// channel on it.
pub struct RabbitConnection {
    host: String,
    conn: RwLock<Option<Connection>>,
}

impl RabbitConnection {
    pub async fn connect(opts: &RabbitMqOptions) -> Result<Self, MessagingError> {
        opts.validate()?;

        let conn = Connection::connect(&opts.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        info!("RabbitMQ connected. host={}:{}", opts.host, opts.port);
        Ok(Self {
            host: opts.host.clone(),
            conn: RwLock::new(Some(conn)),
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.conn
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.status().connected())
    }
}

#[async_trait]
impl BrokerConnection for RabbitConnection {
    type Session = RabbitSession;

    async fn open_session(&self) -> Result<RabbitSession, MessagingError> {
        let guard = self.conn.read().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| MessagingError::Connection("connection is closed".into()))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;
        Ok(RabbitSession::new(channel))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let Some(conn) = self.conn.write().await.take() else {
            return Ok(());
        };
        if !conn.status().connected() {
            return Ok(());
        }

        conn.close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;
        info!("RabbitMQ connection closed. host={}", self.host);
        Ok(())
    }
}
