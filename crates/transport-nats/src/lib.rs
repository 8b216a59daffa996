//! NATS transport for the courier messaging client.
//!
//! Wraps an `async-nats` client behind the `courier-transport` traits. Each
//! engine subscription gets its own forwarding task; JetStream operations go
//! through an `async-nats` JetStream context bound to the requested domain.
//!
//! `async-nats` has no verbose or pedantic protocol modes and a fixed ping
//! budget, so [`NatsConnector`] rejects those options instead of ignoring them.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod convert;
mod jetstream;

pub use connection::{NatsConnector, NatsTransport};
pub use jetstream::NatsJetStream;
