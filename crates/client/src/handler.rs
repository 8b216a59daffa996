use std::fmt::{self, Debug};
use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Message;

/// Receives the messages of a subscription.
///
/// Calls for one subscription never overlap and arrive in the order the
/// transport received the messages. A slow handler delays other
/// subscriptions sharing its delivery worker.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles one message.
    async fn handle(&self, message: Message);
}

#[async_trait]
impl MessageHandler for mpsc::UnboundedSender<Message> {
    async fn handle(&self, message: Message) {
        let _ = self.send(message);
    }
}

#[async_trait]
impl MessageHandler for mpsc::Sender<Message> {
    async fn handle(&self, message: Message) {
        let _ = self.send(message).await;
    }
}

/// Handler built from an async closure, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Message) {
        (self.f)(message).await;
    }
}
