use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use super::{
    heartbeat::HeartbeatMonitor, reader_handler::ReaderHandler, writer_handler::WriterHandler,
    ChannelResource, LinkActivity, ManagementCommand, OutgoingMessage, RegisterChannelResource,
    SplitConnection,
};
use crate::{
    api::{
        connection::{ConnectionEvent, ShutdownReason},
        events::EventRegistry,
    },
    frame::AmqpChannelId,
};

pub(crate) struct HandlerConfig {
    pub channel_max: AmqpChannelId,
    /// `None` disables the heartbeat monitor
    pub heartbeat: Option<Duration>,
    pub missed_heartbeats: u32,
}

/// It spawns tasks for `WriterHandler`, `ReaderHandler` and the heartbeat
/// monitor to handle outgoing/incoming frames concurrently.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_handlers(
    connection: SplitConnection,
    config: HandlerConfig,
    outgoing_tx: mpsc::Sender<OutgoingMessage>,
    outgoing_rx: mpsc::Receiver<OutgoingMessage>,
    mgmt_tx: mpsc::UnboundedSender<ManagementCommand>,
    mgmt_rx: mpsc::UnboundedReceiver<ManagementCommand>,
    events: Arc<EventRegistry<ConnectionEvent>>,
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,
) {
    let (shutdown_notifier, shutdown_listener) = broadcast::channel::<()>(1);
    let activity = Arc::new(LinkActivity::new());

    let (reader, writer) = connection.into_split();

    if let Some(interval) = config.heartbeat {
        let monitor = HeartbeatMonitor::new(
            interval,
            config.missed_heartbeats,
            activity.clone(),
            outgoing_tx.clone(),
            mgmt_tx.clone(),
            shutdown_notifier.subscribe(),
        );
        tokio::spawn(monitor.run_until_shutdown());
    } else {
        debug!("heartbeat disabled");
    }

    // spawn task for write connection handler
    let wh = WriterHandler::new(
        writer,
        outgoing_rx,
        mgmt_tx,
        activity.clone(),
        shutdown_listener,
    );
    tokio::spawn(wh.run_until_shutdown());

    // spawn task for read connection handler
    let rh = ReaderHandler::new(
        reader,
        outgoing_tx,
        mgmt_rx,
        config.channel_max,
        activity,
        events,
        shutdown_tx,
        shutdown_notifier,
    );
    tokio::spawn(rh.run_until_shutdown());
}

/// Returns the allocated channel id, `None` if no id is free or the
/// connection is gone.
pub(crate) async fn register_channel_resource(
    mgmt_tx: &mpsc::UnboundedSender<ManagementCommand>,
    resource: ChannelResource,
) -> Option<AmqpChannelId> {
    let (acker, acker_rx) = oneshot::channel();
    let cmd = ManagementCommand::RegisterChannelResource(RegisterChannelResource {
        resource,
        acker,
    });

    if let Err(err) = mgmt_tx.send(cmd) {
        debug!("failed to register channel resource, cause: {}", err);
        return None;
    }
    match acker_rx.await {
        Ok(res) => res,
        Err(err) => {
            debug!("failed to register channel resource, cause: {}", err);
            None
        }
    }
}
