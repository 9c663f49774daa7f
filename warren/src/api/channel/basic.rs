use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{Channel, ConsumerJob, ConsumerRegistration};
use crate::{
    api::{
        consumer::{Consumer, GetMessage},
        error::Error,
        Result,
    },
    frame::{
        short_str, BasicAck, BasicCancel, BasicCancelOk, BasicConsume, BasicConsumeOk, BasicGet,
        BasicGetEmpty, BasicGetOk, BasicNack, BasicProperties, BasicPublish, BasicQos,
        BasicQosOk, BasicReject, ContentHeader, FieldTable, Frame, Method, FRAME_OVERHEAD,
    },
};

#[derive(Debug, Clone, Default)]
pub struct BasicQosArguments {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

impl BasicQosArguments {
    pub fn new(prefetch_size: u32, prefetch_count: u16, global: bool) -> Self {
        Self {
            prefetch_size,
            prefetch_count,
            global,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicConsumeArguments {
    pub queue: String,
    /// generated when empty
    pub consumer_tag: String,
    pub no_local: bool,
    /// In automatic acknowledgement mode,
    /// a message is considered to be successfully delivered immediately after it is sent
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl BasicConsumeArguments {
    pub fn new(queue: &str, consumer_tag: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            no_local: false,
            no_ack: false,
            exclusive: false,
            no_wait: false,
            arguments: FieldTable::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicCancelArguments {
    pub consumer_tag: String,
    pub no_wait: bool,
}

impl BasicCancelArguments {
    pub fn new(consumer_tag: &str) -> Self {
        Self {
            consumer_tag: consumer_tag.to_owned(),
            no_wait: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicGetArguments {
    pub queue: String,
    pub no_ack: bool,
}

impl BasicGetArguments {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            no_ack: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicAckArguments {
    pub delivery_tag: u64,
    pub multiple: bool,
}

impl BasicAckArguments {
    pub fn new(delivery_tag: u64, multiple: bool) -> Self {
        Self {
            delivery_tag,
            multiple,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicNackArguments {
    pub delivery_tag: u64,
    pub multiple: bool,
    pub requeue: bool,
}

impl BasicNackArguments {
    pub fn new(delivery_tag: u64, multiple: bool, requeue: bool) -> Self {
        Self {
            delivery_tag,
            multiple,
            requeue,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicRejectArguments {
    pub delivery_tag: u64,
    pub requeue: bool,
}

impl BasicRejectArguments {
    pub fn new(delivery_tag: u64, requeue: bool) -> Self {
        Self {
            delivery_tag,
            requeue,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicPublishArguments {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

impl BasicPublishArguments {
    pub fn new(exchange: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory: false,
            immediate: false,
        }
    }
}

/// Content header followed by the body split into frames of at most
/// `frame_max` bytes. `frame_max` of zero means no limit.
fn content_frames(properties: BasicProperties, body: Bytes, frame_max: u32) -> Vec<Frame> {
    let mut frames = vec![Frame::ContentHeader(ContentHeader::new(
        body.len() as u64,
        properties,
    ))];
    if body.is_empty() {
        return frames;
    }
    let chunk_size = match frame_max as usize {
        0 => body.len(),
        max => max - FRAME_OVERHEAD,
    };
    let mut rest = body;
    while !rest.is_empty() {
        let chunk = rest.split_to(chunk_size.min(rest.len()));
        frames.push(Frame::ContentBody(chunk));
    }
    frames
}

/////////////////////////////////////////////////////////////////////////////
impl Channel {
    pub async fn basic_qos(&self, args: BasicQosArguments) -> Result<()> {
        let qos = BasicQos {
            prefetch_size: args.prefetch_size,
            prefetch_count: args.prefetch_count,
            global: args.global,
        };
        self.call(qos, &[BasicQosOk::ID]).await?;
        Ok(())
    }

    /// Start a consumer and return its tag.
    ///
    /// The registration exists before the request is sent, so no delivery can
    /// miss it.
    ///
    /// If the server does not confirm in time the consumer is cancelled again
    /// and `TimeoutError` is returned. Messages the server delivers before the
    /// cancellation takes effect still reach `consumer`, its `on_cancel` runs
    /// once the server confirms the cancellation.
    pub async fn basic_consume<C>(&self, consumer: C, args: BasicConsumeArguments) -> Result<String>
    where
        C: Consumer,
    {
        self.basic_consume_shared(Arc::new(consumer), args).await
    }

    pub(crate) async fn basic_consume_shared(
        &self,
        consumer: Arc<dyn Consumer>,
        args: BasicConsumeArguments,
    ) -> Result<String> {
        self.check_open()?;
        let consumer_tag = if args.consumer_tag.is_empty() {
            self.next_consumer_tag()
        } else {
            args.consumer_tag
        };
        let mut consume = BasicConsume {
            queue: short_str(args.queue.clone())?,
            consumer_tag: short_str(consumer_tag.clone())?,
            arguments: args.arguments,
            ..Default::default()
        };
        consume.set_no_local(args.no_local);
        consume.set_no_ack(args.no_ack);
        consume.set_exclusive(args.exclusive);
        consume.set_no_wait(args.no_wait);

        self.register_consumer(
            &consumer_tag,
            ConsumerRegistration {
                consumer,
                queue: args.queue,
            },
        )?;
        let res = if args.no_wait {
            self.cast(consume).await
        } else {
            self.call(consume, &[BasicConsumeOk::ID])
                .await
                .and_then(|reply| get_expected_method!(reply.method, Method::BasicConsumeOk))
                .map(|consume_ok| {
                    debug!(
                        "consumer {} started on channel {}",
                        consume_ok.consumer_tag, self
                    );
                })
        };
        match res {
            Ok(()) => Ok(consumer_tag),
            Err(err @ Error::TimeoutError(_)) => {
                // the server may still start the consumer, the cancel-ok
                // removes the registration
                warn!(
                    "consumer {} not confirmed on channel {}, cancelling it",
                    consumer_tag, self
                );
                let cancel = BasicCancel {
                    consumer_tag: short_str(consumer_tag.clone())?,
                    no_wait: false,
                };
                if let Err(cancel_err) = self.call(cancel, &[BasicCancelOk::ID]).await {
                    warn!(
                        "failed to cancel consumer {} on channel {}, cause: {}",
                        consumer_tag, self, cancel_err
                    );
                }
                Err(err)
            }
            Err(err) => {
                self.remove_consumer(&consumer_tag);
                Err(err)
            }
        }
    }

    /// Cancel a consumer and return its tag. Deliveries already received are
    /// still handled, then the consumer's `on_cancel` runs.
    pub async fn basic_cancel(&self, args: BasicCancelArguments) -> Result<String> {
        let cancel = BasicCancel {
            consumer_tag: short_str(args.consumer_tag.clone())?,
            no_wait: args.no_wait,
        };
        if args.no_wait {
            self.cast(cancel).await?;
            self.queue_consumer_job(ConsumerJob::Cancel(args.consumer_tag.clone()));
        } else {
            // the dispatcher queues the cancellation when the cancel-ok arrives
            let reply = self.call(cancel, &[BasicCancelOk::ID]).await?;
            get_expected_method!(reply.method, Method::BasicCancelOk)?;
        }
        Ok(args.consumer_tag)
    }

    /// Fetch one message, `None` if the queue is empty.
    pub async fn basic_get(&self, args: BasicGetArguments) -> Result<Option<GetMessage>> {
        let get = BasicGet {
            queue: short_str(args.queue)?,
            no_ack: args.no_ack,
            ..Default::default()
        };
        let reply = self
            .call(get, &[BasicGetOk::ID, BasicGetEmpty::ID])
            .await?;
        match (reply.method, reply.content) {
            (Method::BasicGetEmpty(_), _) => Ok(None),
            (Method::BasicGetOk(get_ok), Some(content)) => Ok(Some(GetMessage {
                delivery_tag: get_ok.delivery_tag,
                redelivered: get_ok.redelivered,
                exchange: get_ok.exchange.into(),
                routing_key: get_ok.routing_key.into(),
                message_count: get_ok.message_count,
                properties: content.properties,
                body: content.body,
            })),
            (other, _) => Err(Error::ProtocolViolation(format!(
                "unexpected reply to basic.get: {}",
                other.id()
            ))),
        }
    }

    /// Publish a message. The method, content header and body frames are
    /// written back to back.
    pub async fn basic_publish(
        &self,
        args: BasicPublishArguments,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<()> {
        properties.validate()?;
        let mut publish = BasicPublish {
            exchange: short_str(args.exchange)?,
            routing_key: short_str(args.routing_key)?,
            ..Default::default()
        };
        publish.set_mandatory(args.mandatory);
        publish.set_immediate(args.immediate);
        let mut frames = vec![publish.into_frame()];
        frames.extend(content_frames(properties, body, self.frame_max()));
        self.cast_batch(frames).await
    }

    pub async fn basic_ack(&self, args: BasicAckArguments) -> Result<()> {
        self.cast(BasicAck {
            delivery_tag: args.delivery_tag,
            multiple: args.multiple,
        })
        .await
    }

    pub async fn basic_nack(&self, args: BasicNackArguments) -> Result<()> {
        let mut nack = BasicNack {
            delivery_tag: args.delivery_tag,
            ..Default::default()
        };
        nack.set_multiple(args.multiple);
        nack.set_requeue(args.requeue);
        self.cast(nack).await
    }

    pub async fn basic_reject(&self, args: BasicRejectArguments) -> Result<()> {
        self.cast(BasicReject {
            delivery_tag: args.delivery_tag,
            requeue: args.requeue,
        })
        .await
    }
}
