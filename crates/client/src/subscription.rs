use std::sync::{Arc, Weak};

use tracing::debug;

use crate::Error;
use crate::connection::ConnectionInner;
use crate::dispatch::SubscriptionState;

/// A live subscription.
///
/// Dropping the handle unsubscribes; keep it alive for as long as messages
/// should flow. The handle does not keep its connection open, and closing the
/// connection invalidates it.
#[derive(Debug)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
    connection: Weak<ConnectionInner>,
}

impl Subscription {
    pub(crate) const fn new(state: Arc<SubscriptionState>, connection: Weak<ConnectionInner>) -> Self {
        Self { state, connection }
    }

    /// Subject filter.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.state.subject
    }

    /// Queue group, if any.
    #[must_use]
    pub fn queue_group(&self) -> Option<&str> {
        self.state.queue_group.as_deref()
    }

    /// Whether messages are still being delivered.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state.is_open()
            && self
                .connection
                .upgrade()
                .is_some_and(|connection| !connection.state.is_closed())
    }

    /// Messages handed to the handler so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.state.delivered()
    }

    /// Stops delivery. Messages already queued for the handler are dropped.
    /// Calling it again, or after the connection closed, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the broker could not be told.
    pub async fn unsubscribe(&self) -> Result<(), Error> {
        if !self.state.close() {
            return Ok(());
        }
        let Some(connection) = self.connection.upgrade() else {
            return Ok(());
        };

        debug!(sid = self.state.sid, subject = %self.state.subject, "unsubscribing");
        connection.dispatcher.remove(self.state.sid);
        connection
            .transport
            .unsubscribe(self.state.sid)
            .await
            .map_err(Error::from)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.state.close() {
            return;
        }
        let Some(connection) = self.connection.upgrade() else {
            return;
        };

        connection.dispatcher.remove(self.state.sid);
        let sid = self.state.sid;
        let transport = Arc::clone(&connection.transport);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = transport.unsubscribe(sid).await;
            });
        }
    }
}
