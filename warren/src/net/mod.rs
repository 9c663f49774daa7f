//! Socket plumbing of a connection: one reader task, one writer task and the
//! heartbeat monitor. Channels talk to these tasks only through message queues.

mod channel_id_repo;
mod channel_manager;
mod connection_manager;
mod error;
mod heartbeat;
mod reader_handler;
mod split_connection;
mod writer_handler;

pub(crate) use connection_manager::*;
pub(crate) use error::*;
pub(crate) use heartbeat::LinkActivity;
pub(crate) use split_connection::*;

/////////////////////////////////////////////////////////////////////////////
use tokio::sync::{mpsc, oneshot};

use crate::{
    api::connection::ShutdownReason,
    frame::{AmqpChannelId, Frame},
};

pub(crate) enum OutgoingMessage {
    Frame(AmqpChannelId, Frame),
    /// frames written back to back, e.g. publish method, content header and bodies
    Batch(AmqpChannelId, Vec<Frame>),
}

pub(crate) struct ChannelResource {
    /// forwards every frame received on the channel to its dispatcher
    pub dispatcher_tx: mpsc::UnboundedSender<Frame>,
}

pub(crate) struct RegisterChannelResource {
    pub resource: ChannelResource,
    /// allocated channel id, `None` if the id pool is exhausted
    pub acker: oneshot::Sender<Option<AmqpChannelId>>,
}

pub(crate) enum ManagementCommand {
    RegisterChannelResource(RegisterChannelResource),
    DeregisterChannelResource(AmqpChannelId),
    /// stop the connection without waiting for the server
    Shutdown(ShutdownReason),
}
