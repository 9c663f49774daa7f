use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use super::{
    channel_manager::ChannelManager, BufferReader, Error, LinkActivity, ManagementCommand,
    OutgoingMessage,
};
use crate::{
    api::{
        connection::{ConnectionEvent, ShutdownReason},
        events::EventRegistry,
    },
    frame::{
        short_str, AmqpChannelId, ConnectionClose, ConnectionCloseOk, Frame, Method,
        DEFAULT_CONN_CHANNEL, FRAME_ERROR,
    },
};

/////////////////////////////////////////////////////////////////////////////

pub(crate) struct ReaderHandler {
    stream: BufferReader,

    /// sender half to forward outgoing message to `WriterHandler`
    outgoing_tx: mpsc::Sender<OutgoingMessage>,

    /// receiver half to receive management command from AMQ Connection/Channel
    mgmt_rx: mpsc::UnboundedReceiver<ManagementCommand>,

    channel_manager: ChannelManager,

    activity: Arc<LinkActivity>,

    /// connection level events, e.g. blocked/unblocked
    events: Arc<EventRegistry<ConnectionEvent>>,

    /// Published once, right before the handler exits.
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,

    /// Notify WriterHandler and heartbeat monitor to shutdown.
    /// They are notified when this sender drops together with the handler.
    #[allow(dead_code /* notify shutdown just by dropping the instance */)]
    shutdown_notifier: broadcast::Sender<()>,
}

impl ReaderHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: BufferReader,
        outgoing_tx: mpsc::Sender<OutgoingMessage>,
        mgmt_rx: mpsc::UnboundedReceiver<ManagementCommand>,
        channel_max: AmqpChannelId,
        activity: Arc<LinkActivity>,
        events: Arc<EventRegistry<ConnectionEvent>>,
        shutdown_tx: watch::Sender<Option<ShutdownReason>>,
        shutdown_notifier: broadcast::Sender<()>,
    ) -> Self {
        Self {
            stream,
            outgoing_tx,
            mgmt_rx,
            channel_manager: ChannelManager::new(channel_max),
            activity,
            events,
            shutdown_tx,
            shutdown_notifier,
        }
    }

    /// Frames on channel 0 are handled in place.
    async fn handle_connection_frame(&mut self, frame: Frame) -> Option<ShutdownReason> {
        match frame {
            Frame::Heartbeat => {
                trace!("heartbeat received");
                None
            }
            // Server request to close connection
            Frame::Method(Method::ConnectionClose(close)) => {
                warn!(
                    "server closed connection, code: {}, text: {}",
                    close.reply_code, close.reply_text
                );
                let close_ok = OutgoingMessage::Frame(
                    DEFAULT_CONN_CHANNEL,
                    ConnectionCloseOk::default().into_frame(),
                );
                if let Err(err) = self.outgoing_tx.send(close_ok).await {
                    debug!("failed to respond close-ok, cause: {}", err);
                }
                Some(ShutdownReason::peer(close.reply_code, close.reply_text.into()))
            }
            // Close connection response from server
            Frame::Method(Method::ConnectionCloseOk(_)) => {
                info!("server confirmed connection close");
                Some(ShutdownReason::application())
            }
            Frame::Method(Method::ConnectionBlocked(blocked)) => {
                warn!("connection blocked by server, reason: {}", blocked.reason);
                self.events.emit(&ConnectionEvent::Blocked(blocked.reason.into()));
                None
            }
            Frame::Method(Method::ConnectionUnblocked(_)) => {
                info!("connection unblocked by server");
                self.events.emit(&ConnectionEvent::Unblocked);
                None
            }
            other => {
                debug!("discard unexpected frame on channel 0: {:?}", other);
                None
            }
        }
    }

    async fn handle_frame(
        &mut self,
        channel_id: AmqpChannelId,
        frame: Frame,
    ) -> Option<ShutdownReason> {
        if channel_id == DEFAULT_CONN_CHANNEL {
            return self.handle_connection_frame(frame).await;
        }
        match self.channel_manager.get_dispatcher(channel_id) {
            Some(dispatcher) => {
                if let Err(err) = dispatcher.send(frame) {
                    debug!(
                        "dispatcher of channel {} already stopped, discard frame: {:?}",
                        channel_id, err.0
                    );
                }
            }
            None => debug!(
                "no dispatcher registered for channel {}, discard frame: {:?}",
                channel_id, frame
            ),
        }
        None
    }

    fn handle_command(&mut self, command: ManagementCommand) -> Option<ShutdownReason> {
        match command {
            ManagementCommand::RegisterChannelResource(cmd) => {
                let id = self.channel_manager.insert_resource(cmd.resource);
                if cmd.acker.send(id).is_err() {
                    // requester gave up, give the id back
                    if let Some(id) = id {
                        self.channel_manager.remove_resource(id);
                    }
                }
                None
            }
            ManagementCommand::DeregisterChannelResource(channel_id) => {
                if self.channel_manager.remove_resource(channel_id).is_none() {
                    debug!("channel {} already deregistered", channel_id);
                }
                None
            }
            ManagementCommand::Shutdown(reason) => Some(reason),
        }
    }

    pub async fn run_until_shutdown(mut self) {
        let reason = loop {
            tokio::select! {
                biased;

                command = self.mgmt_rx.recv() => {
                    let command = match command {
                        // every handle to the connection is gone
                        None => break ShutdownReason::application(),
                        Some(v) => v,
                    };
                    if let Some(reason) = self.handle_command(command) {
                        break reason;
                    }
                }

                res = self.stream.read_frame() => {
                    match res {
                        Ok((channel_id, frame)) => {
                            self.activity.record_rx();
                            if let Some(reason) = self.handle_frame(channel_id, frame).await {
                                break reason;
                            }
                        }
                        Err(Error::FramingError(err)) => {
                            error!("failed to decode frame, cause: {}", err);
                            let close = ConnectionClose {
                                reply_code: FRAME_ERROR,
                                reply_text: short_str(err.to_string()).unwrap_or_default(),
                                ..Default::default()
                            };
                            self.outgoing_tx
                                .try_send(OutgoingMessage::Frame(DEFAULT_CONN_CHANNEL, close.into_frame()))
                                .ok();
                            break ShutdownReason::protocol_violation(err.to_string());
                        }
                        Err(err) => {
                            error!("failed to read frame, cause: {}", err);
                            break ShutdownReason::network_error(err.to_string());
                        }
                    }
                }
            }
        };

        info!("shutdown ReaderHandler, reason: {}", reason);
        self.shutdown_tx.send_replace(Some(reason.clone()));
        self.events.emit(&ConnectionEvent::Shutdown(reason));
        // `self` drops here: channel dispatchers see their frame queue closed,
        // writer and heartbeat monitor see `shutdown_notifier` dropped
    }
}
