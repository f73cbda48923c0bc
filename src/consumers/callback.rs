//! The `Callback` trait follows the same approach as `tide`'s endpoint handlers.
use crate::consumers::Message;
use std::future::Future;
use std::sync::Arc;

/// Implementers of `Callback` process the messages received by a
/// [`TopicConsumer`](crate::consumers::TopicConsumer).
///
/// # Scope
///
/// `handle` does not get access to the underlying channel.
/// The consumer acknowledges the message once `handle` returns, **whether it succeeded or not**:
/// a failure (an `Err` or a panic) is logged and the message is not redelivered.
/// If you need retries, they belong inside the callback.
///
/// # Implementers
///
/// You can implement `Callback` for a struct or enum, but most of the time wrapping an async
/// closure in [`ClosureCallback`] is all you need:
///
/// ```rust
/// use carrot_topic::consumers::{ClosureCallback, Message};
///
/// let callback = ClosureCallback(|message: Message| async move {
///     println!("{:?}", message.payload);
///     Ok::<_, anyhow::Error>(())
/// });
/// # drop(callback);
/// ```
#[async_trait::async_trait]
pub trait Callback: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<C> Callback for Box<C>
where
    C: Callback + ?Sized,
{
    async fn handle(&self, message: Message) -> Result<(), anyhow::Error> {
        C::handle(self, message).await
    }
}

#[async_trait::async_trait]
impl<C> Callback for Arc<C>
where
    C: Callback + ?Sized,
{
    async fn handle(&self, message: Message) -> Result<(), anyhow::Error> {
        C::handle(self, message).await
    }
}

/// Wrapper type to turn an async closure into a [`Callback`].
///
/// The closure can return any error type convertible into `anyhow::Error`.
pub struct ClosureCallback<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> Callback for ClosureCallback<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), anyhow::Error> {
        (self.0)(message).await.map_err(Into::into)
    }
}
