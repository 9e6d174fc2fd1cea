// commonkit-messaging-core/src/topic.rs
use serde::Serialize;

use crate::MessagingError;

/// Anything that can name its destination queue and serialize itself.
pub trait Topic: Send + Sync {
    fn topic_name(&self) -> &str;

    fn body(&self) -> Result<Vec<u8>, MessagingError>;
}

/// Topic whose body is the JSON encoding of `payload`.
#[derive(Debug, Clone)]
pub struct JsonTopic<T> {
    name: String,
    payload: T,
}

impl<T> JsonTopic<T>
where
    T: Serialize + Send + Sync,
{
    pub fn new(name: impl Into<String>, payload: T) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }
}

impl<T> Topic for JsonTopic<T>
where
    T: Serialize + Send + Sync,
{
    fn topic_name(&self) -> &str {
        &self.name
    }

    fn body(&self) -> Result<Vec<u8>, MessagingError> {
        Ok(serde_json::to_vec(&self.payload)?)
    }
}

/// Topic carrying an already encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTopic {
    pub name: String,
    pub body: Vec<u8>,
}

impl RawTopic {
    pub fn new(name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

impl Topic for RawTopic {
    fn topic_name(&self) -> &str {
        &self.name
    }

    fn body(&self) -> Result<Vec<u8>, MessagingError> {
        Ok(self.body.clone())
    }
}
