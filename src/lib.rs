//! Self-healing AMQP 0-9-1 client built on `lapin`.
//!
//! A [`connection::Connection`] owns a redialable transport plus a set of
//! independently-recovering channels: at most one publisher channel, and at
//! most one consumer channel per queue. The connection dials the broker,
//! keeps a guard task watching for an asynchronous transport close, and
//! reconnects on a fixed delay; each channel reopens independently on top
//! of whatever transport the connection currently holds. Publishes made
//! while the publisher channel is down are cached and replayed once it
//! reopens; deliveries are dispatched to routing-key handlers and
//! acked/nacked according to the handler's outcome.

pub mod cache;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod schema;
pub mod uri;

pub use cache::{DeliveryMode, Priority};
pub use channel::consumer::Message;
pub use channel::publisher::PublishOptions;
pub use channel::ChannelState;
pub use codec::{Codec, JsonCodec, TextCodec};
pub use config::Config;
pub use connection::{Connection, ConnectionOptions};
pub use error::{HandlerOutcome, RabbitMqError, Result};
pub use handler::{ConsumerDescriptor, DeliveryHandler, HandlerRegistry};
