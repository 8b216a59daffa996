use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::Error;

const EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a [`crate::Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Not connected.
    Disconnected,
    /// Initial connect in progress.
    Connecting,
    /// Connected and usable.
    Connected,
    /// Closed for good; every operation fails with [`Error::Closed`].
    Closed,
    /// Link lost, the transport is retrying.
    Reconnecting,
    /// Draining subscriptions before close.
    DrainingSubs,
    /// Flushing publishes before close.
    DrainingPubs,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Reconnecting => "reconnecting",
            Self::DrainingSubs => "draining subscriptions",
            Self::DrainingPubs => "draining publishes",
        };
        f.write_str(name)
    }
}

/// Notifications raised by a connection.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// The status changed.
    StatusChanged(Status),
    /// Something failed asynchronously, e.g. a fire-and-forget publish.
    Error {
        /// What went wrong.
        error: Error,
        /// Subject involved, when known.
        subject: Option<String>,
    },
}

/// Status, events and last error, shared with background tasks.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    status: watch::Sender<Status>,
    events: broadcast::Sender<ConnectionEvent>,
    last_error: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            status: watch::Sender::new(Status::Disconnected),
            events: broadcast::Sender::new(EVENT_CAPACITY),
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn event_receiver(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Moves to `status` and notifies, unless already there or closed.
    pub fn set_status(&self, status: Status) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status || *current == Status::Closed {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(%status, "connection status changed");
            let _ = self.events.send(ConnectionEvent::StatusChanged(status));
        }
    }

    pub fn report(&self, error: Error, subject: Option<String>) {
        warn!(%error, ?subject, "asynchronous connection error");
        *self.last_error.lock() = Some(error.to_string());
        let _ = self.events.send(ConnectionEvent::Error { error, subject });
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().clone().unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}
