pub mod broker;
pub mod error;
pub mod handler;
pub mod listener;
pub mod logging;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod topic;
pub mod topics;
pub mod types;

pub use broker::{BrokerConnection, Session};
pub use error::MessagingError;
pub use handler::MessageHandler;
pub use listener::{Listener, ListenerState};
pub use memory::{MemoryBroker, MemoryConnection, MemorySession};
pub use publisher::Publisher;
pub use queue::declare_queue;
pub use topic::{JsonTopic, RawTopic, Topic};
pub use topics::{DeviceInfoCache, DeviceUpdateTopic, DEVICE_UPDATE_TOPIC};
pub use types::{Confirmation, OutboundMessage, QueueOptions, TEXT_PLAIN};
