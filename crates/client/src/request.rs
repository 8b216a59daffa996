use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_transport::subject::is_valid_publish_subject;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::trace;

use crate::connection::ConnectionInner;
use crate::dispatch::Route;
use crate::{Error, Message};

/// The eventual outcome of [`crate::Connection::async_request`].
///
/// Resolves exactly once: with the reply, [`Error::NoResponders`],
/// [`Error::Timeout`], or [`Error::Closed`] when the connection went away
/// first. Dropping it does not cancel the request.
#[derive(Debug)]
pub struct PendingReply {
    receiver: oneshot::Receiver<Result<Message, Error>>,
}

impl PendingReply {
    pub(crate) const fn new(receiver: oneshot::Receiver<Result<Message, Error>>) -> Self {
        Self { receiver }
    }

    /// Takes the outcome if it is already known, without waiting.
    ///
    /// Returns `None` while the request is in flight. Once the outcome has
    /// been taken, later calls report [`Error::Closed`].
    pub fn try_take(&mut self) -> Option<Result<Message, Error>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::Closed)),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Message, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(Error::Closed)))
    }
}

impl ConnectionInner {
    /// Publishes `message` with a fresh inbox as reply subject and waits for
    /// the first answer. The inbox listener is released on every path.
    pub(crate) async fn round_trip(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, Error> {
        self.state.ensure_open()?;
        if !is_valid_publish_subject(&message.subject) {
            return Err(Error::InvalidSubject(message.subject));
        }

        let inbox = self.transport.new_inbox();
        let sid = self.next_sid();
        let (tx, rx) = oneshot::channel();
        self.dispatcher.register(sid, Route::Reply(tx));

        if let Err(error) = self.transport.subscribe(sid, &inbox, None).await {
            self.dispatcher.remove(sid);
            return Err(error.into());
        }

        trace!(subject = %message.subject, %inbox, "sending request");
        message.reply = Some(inbox);
        let outcome = match self.transport.publish(message.to_outbound()).await {
            Ok(()) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) if reply.is_no_responders() => Err(Error::NoResponders),
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(Error::Closed),
                Err(_) => Err(Error::Timeout),
            },
            Err(error) => Err(error.into()),
        };

        self.dispatcher.remove(sid);
        let _ = self.transport.unsubscribe(sid).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_dropped_sender_resolves_closed() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingReply::new(rx);
        drop(tx);
        assert_matches!(pending.await, Err(Error::Closed));
    }

    #[tokio::test]
    async fn test_try_take_before_and_after() {
        let (tx, rx) = oneshot::channel();
        let mut pending = PendingReply::new(rx);
        assert!(pending.try_take().is_none());

        tx.send(Ok(Message::new("a", "b"))).unwrap();
        let reply = pending.try_take().unwrap().unwrap();
        assert_eq!(reply.payload, "b");
        assert_matches!(pending.try_take(), Some(Err(Error::Closed)));
    }
}
