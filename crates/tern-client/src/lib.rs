//! Connection engine for the NATS client protocol.
//!
//! One long-lived [`Connection`] maintains a single TCP (optionally TLS)
//! session: many producers enqueue commands onto a lock-free queue, a single
//! writer loop coalesces them into batched socket writes, a streaming reader
//! parses inbound frames and routes them to subscriptions and request
//! waiters, and a supervisor reconnects with subscription replay when the
//! socket dies.
//!
//! ```no_run
//! use tern_client::{Connection, ConnectOptions};
//!
//! # async fn run() -> tern_client::Result<()> {
//! let connection = Connection::from_url("nats://localhost:4222")?;
//! connection.connect().await?;
//! let mut updates = connection.subscribe("updates")?;
//! connection.publish("updates", b"payload")?;
//! if let Some(message) = updates.next().await {
//!     assert_eq!(message.payload.as_ref(), b"payload");
//! }
//! connection.dispose().await;
//! # Ok(())
//! # }
//! ```
pub use client::connection::{Connection, PublishMessage, State};
pub use client::subscriptions::{Message, SubscriptionHandle, Subscriber};
pub use config::{ConnectOptions, ServerAddr, TlsMode, TlsOptions, TlsVersion};
pub use error::{Error, Result};
pub use tern_wire::{ConnectInfo, HeaderMap, ServerInfo};

pub mod client;
mod commands;
pub mod config;
mod error;
mod pool;
mod socket;
