//! Asynchronous messaging client.
//!
//! A [`Connection`] publishes, subscribes and runs request/reply over a
//! pluggable transport. Inbound messages are handed to [`MessageHandler`]s on
//! a fixed pool of delivery workers; each subscription keeps its order.
//! [`JetStream`] contexts add durable publishing with de-duplication and
//! optimistic concurrency, and push or pull consumption with explicit
//! acknowledgment.
//!
//! ```no_run
//! # async fn example() -> Result<(), courier_client::Error> {
//! use std::time::Duration;
//!
//! use courier_client::{Connection, Message, handler_fn};
//! use courier_transport_memory::MemoryConnector;
//!
//! let connection = Connection::connect_to_server(&MemoryConnector, "memory://local").await?;
//! let _subscription = connection
//!     .subscribe("greet.*", handler_fn(|message: Message| async move {
//!         println!("{}", String::from_utf8_lossy(&message.payload));
//!     }))
//!     .await?;
//! connection.publish(Message::new("greet.joe", "hello")).await?;
//! connection.drain(Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod dispatch;
mod error;
mod handler;
mod message;
mod request;
mod status;
mod subscription;

pub mod jetstream;

pub use connection::{Connection, DEFAULT_PING_TIMEOUT};
pub use error::Error;
pub use handler::{HandlerFn, MessageHandler, handler_fn};
pub use jetstream::{JetStream, JetStreamEvent, PullSubscription, PushSubscription};
pub use message::Message;
pub use request::PendingReply;
pub use status::{ConnectionEvent, Status};
pub use subscription::Subscription;

pub use courier_transport::{
    ConnectOptions, Connector, Headers, JetStreamOptions, PublishAck, PublishOptions,
};
