//! Consumer handlers and the messages handed to them.
//!
//! Implement [`Consumer`] and pass it to [`Channel::basic_consume`].
//!
//! # Example
//! ```rust,no_run
//! use async_trait::async_trait;
//! use warren::channel::{BasicAckArguments, Channel};
//! use warren::consumer::{Consumer, Delivery};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl Consumer for Printer {
//!     async fn on_delivery(&self, channel: &Channel, delivery: Delivery) {
//!         println!("{:?}", delivery.body);
//!         let args = BasicAckArguments::new(delivery.delivery_tag, false);
//!         channel.basic_ack(args).await.ok();
//!     }
//! }
//! ```
//!
//! [`Channel::basic_consume`]: crate::channel::Channel::basic_consume

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use super::{
    channel::{BasicAckArguments, Channel},
    connection::ShutdownReason,
};
use crate::frame::{AmqpReplyCode, BasicProperties};

/// A message pushed by the server to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// A message fetched by [`Channel::basic_get`](crate::channel::Channel::basic_get).
#[derive(Debug, Clone)]
pub struct GetMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// messages left in the queue
    pub message_count: u32,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// A published message the server could not route.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub reply_code: AmqpReplyCode,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Handler of the deliveries of one consumer registration.
///
/// Handlers run on the channel's consumer dispatcher. With a channel
/// concurrency of 1, `on_delivery` calls never overlap and follow the order
/// the server sent the messages in. With a higher concurrency they may run
/// in parallel, in any order.
///
/// A panic in a handler is logged, the delivery is considered handled.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn on_delivery(&self, channel: &Channel, delivery: Delivery);

    /// Called exactly once when the consumer is cancelled, by the client or
    /// by the server. No delivery follows.
    async fn on_cancel(&self, consumer_tag: &str) {
        info!("consumer {} cancelled", consumer_tag);
    }

    /// The channel closed while the consumer was registered.
    async fn on_shutdown(&self, consumer_tag: &str, reason: &ShutdownReason) {
        info!("consumer {} stopped, {}", consumer_tag, reason);
    }
}

/// Logs every delivery, and acks it unless consuming in `no_ack` mode.
pub struct DefaultConsumer {
    no_ack: bool,
}

impl DefaultConsumer {
    pub fn new(no_ack: bool) -> Self {
        Self { no_ack }
    }
}

#[async_trait]
impl Consumer for DefaultConsumer {
    async fn on_delivery(&self, channel: &Channel, delivery: Delivery) {
        info!(
            "consume delivery {} on channel {}, routing key: {}, {} bytes",
            delivery.delivery_tag,
            channel,
            delivery.routing_key,
            delivery.body.len()
        );
        // ack explicitly if no_ack = false
        if !self.no_ack {
            let args = BasicAckArguments::new(delivery.delivery_tag, false);
            if let Err(err) = channel.basic_ack(args).await {
                warn!("failed to ack {}: {}", delivery.delivery_tag, err);
            }
        }
    }
}
