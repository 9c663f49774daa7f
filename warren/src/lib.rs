//! AMQP 0-9-1 client implementation compatible with RabbitMQ.
//!
//! This library is based on async tokio runtime. One [`Connection`] carries
//! many [`Channel`]s over a single socket; consumers run on a per-channel
//! dispatcher with configurable concurrency, and a [`RecoverableConnection`]
//! reconnects and restores its topology after network failures.
//!
//! [`Connection`]: connection::Connection
//! [`Channel`]: channel::Channel
//! [`RecoverableConnection`]: recovery::RecoverableConnection
//
mod api;
mod frame;
mod net;
pub mod recovery;

#[cfg(test)]
mod test_utils;

// public API
pub use api::*;
pub use frame::{
    AmqpChannelId, AmqpReplyCode, BasicProperties, FieldName, FieldTable, FieldValue, LongStr,
    ShortStr, DELIVERY_MODE_PERSISTENT, DELIVERY_MODE_TRANSIENT,
};
