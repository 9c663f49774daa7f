//! Per-channel frame demultiplexer.
//!
//! Receives every frame the reader routes to the channel, in receipt order.
//! Replies resolve the pending continuation, content-carrying methods are
//! assembled with their header and body frames, and server-initiated methods
//! (close, flow, cancel) are handled in place.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::{
    continuation::{Content, Reply},
    Channel, ChannelEvent, ConsumerJob,
};
use crate::{
    api::{
        connection::ShutdownReason,
        consumer::{Delivery, ReturnedMessage},
        error::Error,
    },
    frame::{
        BasicCancelOk, BasicDeliver, BasicGetOk, BasicReturn, BasicProperties, ChannelCloseOk,
        ChannelFlowOk, ContentHeader, Frame, Method,
    },
    net::OutgoingMessage,
};

/// Method whose content is being assembled.
enum ContentMethod {
    Deliver(BasicDeliver),
    Return(BasicReturn),
    GetOk(BasicGetOk),
}

struct PendingContent {
    method: ContentMethod,
    /// `None` until the content header arrived
    header: Option<ContentHeader>,
    body: BytesMut,
}

pub(crate) struct ChannelDispatcher {
    channel: Channel,
    dispatcher_rx: mpsc::UnboundedReceiver<Frame>,
    pending: Option<PendingContent>,
}

impl ChannelDispatcher {
    pub fn new(channel: Channel, dispatcher_rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            channel,
            dispatcher_rx,
            pending: None,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(self.run_until_shutdown());
    }

    async fn respond(&self, method: impl Into<Method>) {
        let message = OutgoingMessage::Frame(self.channel.channel_id(), Frame::Method(method.into()));
        if let Err(err) = self.channel.shared.outgoing_tx.send(message).await {
            debug!(
                "failed to respond on channel {}, cause: {}",
                self.channel, err
            );
        }
    }

    fn start_content(&mut self, method: ContentMethod) {
        if self.pending.is_some() {
            warn!(
                "incomplete content discarded on channel {}",
                self.channel
            );
        }
        self.pending = Some(PendingContent {
            method,
            header: None,
            body: BytesMut::new(),
        });
    }

    fn handle_content_header(&mut self, header: ContentHeader) {
        match self.pending.as_mut() {
            Some(pending) if pending.header.is_none() => {
                pending.body.reserve(header.body_size as usize);
                pending.header = Some(header);
                self.complete_content_if_ready();
            }
            _ => warn!(
                "unexpected content header on channel {}, discarded",
                self.channel
            ),
        }
    }

    fn handle_content_body(&mut self, body: Bytes) {
        match self.pending.as_mut() {
            Some(pending) if pending.header.is_some() => {
                pending.body.extend_from_slice(&body);
                self.complete_content_if_ready();
            }
            _ => warn!(
                "unexpected content body on channel {}, discarded",
                self.channel
            ),
        }
    }

    fn complete_content_if_ready(&mut self) {
        let ready = match self.pending {
            Some(PendingContent {
                header: Some(ref header),
                ref body,
                ..
            }) => body.len() as u64 >= header.body_size,
            _ => false,
        };
        if !ready {
            return;
        }
        if let Some(PendingContent {
            method,
            header: Some(header),
            body,
        }) = self.pending.take()
        {
            self.dispatch_content(method, header.properties, body.freeze());
        }
    }

    fn dispatch_content(&mut self, method: ContentMethod, properties: BasicProperties, body: Bytes) {
        match method {
            ContentMethod::Deliver(deliver) => {
                trace!(
                    "deliver {} to consumer {} on channel {}",
                    deliver.delivery_tag,
                    deliver.consumer_tag,
                    self.channel
                );
                self.channel
                    .queue_consumer_job(ConsumerJob::Deliver(Delivery {
                        consumer_tag: deliver.consumer_tag.into(),
                        delivery_tag: deliver.delivery_tag,
                        redelivered: deliver.redelivered,
                        exchange: deliver.exchange.into(),
                        routing_key: deliver.routing_key.into(),
                        properties,
                        body,
                    }));
            }
            ContentMethod::Return(ret) => {
                warn!(
                    "message returned on channel {}, code: {}, text: {}",
                    self.channel, ret.reply_code, ret.reply_text
                );
                self.channel
                    .events()
                    .emit(&ChannelEvent::Returned(ReturnedMessage {
                        reply_code: ret.reply_code,
                        reply_text: ret.reply_text.into(),
                        exchange: ret.exchange.into(),
                        routing_key: ret.routing_key.into(),
                        properties,
                        body,
                    }));
            }
            ContentMethod::GetOk(get_ok) => {
                let reply = Reply {
                    method: Method::BasicGetOk(get_ok),
                    content: Some(Content { properties, body }),
                };
                if self.channel.resolve(reply).is_err() {
                    debug!("no basic.get waiting on channel {}", self.channel);
                }
            }
        }
    }

    /// Returns `false` once the channel is closed.
    async fn handle_method(&mut self, method: Method) -> bool {
        match method {
            Method::BasicDeliver(deliver) => self.start_content(ContentMethod::Deliver(deliver)),
            Method::BasicReturn(ret) => self.start_content(ContentMethod::Return(ret)),
            Method::BasicGetOk(get_ok) => self.start_content(ContentMethod::GetOk(get_ok)),

            // server request to close the channel
            Method::ChannelClose(close) => {
                warn!(
                    "channel {} closed by server, code: {}, text: {}",
                    self.channel, close.reply_code, close.reply_text
                );
                self.respond(ChannelCloseOk::default()).await;
                let reason = ShutdownReason::peer(close.reply_code, close.reply_text.into());
                let err = Error::ChannelClosedError(reason.to_string());
                self.channel.finish(reason, err, true);
                return false;
            }
            // reply to our channel.close, the closing side finishes the channel
            Method::ChannelCloseOk(close_ok) => {
                if self.channel.resolve(Reply::new(close_ok.into())).is_err() {
                    debug!("late close-ok on channel {}", self.channel);
                }
            }
            Method::ChannelFlow(flow) => {
                debug!("server set flow {} on channel {}", flow.active, self.channel);
                self.channel.set_flow(flow.active);
                self.respond(ChannelFlowOk {
                    active: flow.active,
                })
                .await;
                self.channel
                    .events()
                    .emit(&ChannelEvent::FlowChanged(flow.active));
            }
            // broker cancelled a consumer, e.g. because its queue was deleted
            Method::BasicCancel(cancel) => {
                warn!(
                    "consumer {} cancelled by server on channel {}",
                    cancel.consumer_tag, self.channel
                );
                self.channel
                    .queue_consumer_job(ConsumerJob::Cancel(cancel.consumer_tag.to_string()));
                if !cancel.no_wait {
                    self.respond(BasicCancelOk {
                        consumer_tag: cancel.consumer_tag,
                    })
                    .await;
                }
            }
            // deliveries queued before the cancel-ok are still handed out
            Method::BasicCancelOk(cancel_ok) => {
                self.channel
                    .queue_consumer_job(ConsumerJob::Cancel(cancel_ok.consumer_tag.to_string()));
                if let Err(reply) = self.channel.resolve(Reply::new(cancel_ok.into())) {
                    debug!(
                        "unsolicited {} on channel {}",
                        reply.method.id(),
                        self.channel
                    );
                }
            }
            other => {
                if let Err(reply) = self.channel.resolve(Reply::new(other)) {
                    debug!(
                        "discard {} on channel {}, no request waiting for it",
                        reply.method.id(),
                        self.channel
                    );
                }
            }
        }
        true
    }

    pub async fn run_until_shutdown(mut self) {
        trace!("starts up dispatcher task of channel {}", self.channel);
        while let Some(frame) = self.dispatcher_rx.recv().await {
            match frame {
                Frame::Method(method) => {
                    if !self.handle_method(method).await {
                        break;
                    }
                }
                Frame::ContentHeader(header) => self.handle_content_header(header),
                Frame::ContentBody(body) => self.handle_content_body(body),
                Frame::Heartbeat => {
                    error!("heartbeat routed to channel {}, discarded", self.channel)
                }
            }
        }

        // frame queue closed: the connection is gone, or the channel was
        // deregistered after close
        let reason = self
            .channel
            .connection_shutdown_reason()
            .unwrap_or_else(ShutdownReason::application);
        let err = Error::ConnectionClosedError(reason.to_string());
        self.channel.finish(reason, err, false);
        debug!("exit dispatcher of channel {}", self.channel);
    }
}
