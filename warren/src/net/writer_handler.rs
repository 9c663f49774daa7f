use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

use super::{BufferWriter, Error, LinkActivity, ManagementCommand, OutgoingMessage};
use crate::api::connection::ShutdownReason;

/// The only task writing to the socket, so frames never interleave mid-frame.
pub(super) struct WriterHandler {
    stream: BufferWriter,
    /// receiver half to forward outgoing messages from AMQ connection/channel to server
    outgoing_rx: mpsc::Receiver<OutgoingMessage>,
    /// tells the reader to stop when the socket can no longer be written
    mgmt_tx: mpsc::UnboundedSender<ManagementCommand>,
    activity: Arc<LinkActivity>,
    /// listener of shutdown signal
    shutdown: broadcast::Receiver<()>,
}

impl WriterHandler {
    pub fn new(
        stream: BufferWriter,
        outgoing_rx: mpsc::Receiver<OutgoingMessage>,
        mgmt_tx: mpsc::UnboundedSender<ManagementCommand>,
        activity: Arc<LinkActivity>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            outgoing_rx,
            mgmt_tx,
            activity,
            shutdown,
        }
    }

    async fn write(&mut self, message: OutgoingMessage) -> Result<(), Error> {
        match message {
            OutgoingMessage::Frame(channel_id, frame) => {
                self.stream.write_frame(channel_id, &frame).await?
            }
            OutgoingMessage::Batch(channel_id, frames) => {
                self.stream.write_frames(channel_id, &frames).await?
            }
        }
        self.activity.record_tx();
        Ok(())
    }

    pub async fn run_until_shutdown(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    debug!("WriterHandler received shutdown notification");
                    // best effort: e.g. close-ok in reply to a server close
                    while let Ok(message) = self.outgoing_rx.try_recv() {
                        if self.write(message).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                message = self.outgoing_rx.recv() => {
                    let message = match message {
                        None => break,
                        Some(v) => v,
                    };
                    match self.write(message).await {
                        Ok(()) => {}
                        // nothing was written, the link is intact
                        Err(Error::FramingError(err)) => {
                            error!("failed to encode frame, dropped: {}", err);
                        }
                        Err(err) => {
                            error!("failed to send frame over network, cause: {}", err);
                            let reason = ShutdownReason::network_error(err.to_string());
                            self.mgmt_tx.send(ManagementCommand::Shutdown(reason)).ok();
                            break;
                        }
                    }
                }
            }
        }
        if let Err(err) = self.stream.close().await {
            debug!("socket write half already closed: {}", err);
        }
        debug!("shutdown WriterHandler");
    }
}
