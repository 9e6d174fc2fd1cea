mod connection;
mod options;
mod session;

pub use connection::RabbitConnection;
pub use options::{RabbitMqOptions, DEFAULT_SCHEME};
pub use session::RabbitSession;

use commonkit_messaging_core::{Listener, Publisher};

pub type RabbitPublisher = Publisher<RabbitSession>;
pub type RabbitListener<B> = Listener<RabbitSession, B>;
