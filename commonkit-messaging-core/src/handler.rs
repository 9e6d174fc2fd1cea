// commonkit-messaging-core/src/handler.rs
use crate::MessagingError;
use async_trait::async_trait;

/// Per-message callback of a [`Listener`](crate::Listener).
///
/// Plain closures `Fn(&B) -> Result<(), MessagingError>` implement it; types
/// that need to await can implement it directly.
#[async_trait]
pub trait MessageHandler<B>: Send + Sync
where
    B: Send + Sync + 'static,
{
    async fn handle(&self, body: &B) -> Result<(), MessagingError>;
}

#[async_trait]
impl<B, F> MessageHandler<B> for F
where
    B: Send + Sync + 'static,
    F: Fn(&B) -> Result<(), MessagingError> + Send + Sync,
{
    async fn handle(&self, body: &B) -> Result<(), MessagingError> {
        (self)(body)
    }
}
