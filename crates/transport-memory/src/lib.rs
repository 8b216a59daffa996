//! In-memory transport for the courier messaging client.
//!
//! A [`MemoryServer`] is a small broker living inside the process: subject
//! routing with wildcards, queue groups, "no responders" notices, and a
//! JetStream emulation with streams, durable consumers, de-duplication,
//! expectation guards and ack-wait redelivery. Clients reach servers through
//! [`MemoryConnector`] by URL (e.g. `memory://orders`), so connection options,
//! reconnection and failover behave as they would against a real broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod jetstream;
mod server;

pub use connection::{MemoryConnection, MemoryConnector, MemoryJetStream};
pub use jetstream::{ConsumerConfig, ConsumerInfo, StreamConfig, StreamInfo};
pub use server::{Auth, MemoryServer, ServerOptions};

use std::sync::LazyLock;

use dashmap::DashMap;

/// Servers reachable by URL.
static GLOBAL_REGISTRY: LazyLock<DashMap<String, MemoryServer>> = LazyLock::new(DashMap::new);
