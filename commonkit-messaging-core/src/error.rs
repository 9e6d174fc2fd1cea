// commonkit-messaging-core/src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("queue declare error: {0}")]
    QueueDeclare(String),

    #[error("publisher init error: {0}")]
    PublisherInit(#[source] Box<MessagingError>),

    #[error("listener init error: {0}")]
    ListenerInit(#[source] Box<MessagingError>),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("no handler assigned to listener")]
    MissingHandler,

    #[error("handler cannot be assigned once the listener has started")]
    HandlerAfterStart,

    #[error("listener is already receiving")]
    AlreadyListening,

    #[error("listener is closed")]
    ListenerClosed,
}

impl MessagingError {
    /// Returns the innermost error of an init composite.
    pub fn root(&self) -> &MessagingError {
        match self {
            Self::PublisherInit(inner) | Self::ListenerInit(inner) => inner.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
