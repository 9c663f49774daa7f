//! API implementation of AMQP Channel
//!
//! A channel is opened by [`Connection::open_channel`]. Every channel runs
//! two background tasks: a dispatcher demultiplexing the frames routed to the
//! channel, and a consumer dispatcher running consumer handlers under the
//! channel's concurrency.
//!
//! Synchronous methods (declares, binds, `basic.consume`, ...) are strictly
//! request/response: at most one is outstanding per channel. Concurrent
//! callers on clones of the same channel queue up behind each other.
//!
//! [`Connection::open_channel`]: crate::connection::Connection::open_channel

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, info, warn};

use crate::{
    api::{
        connection::{SharedConnectionInner, ShutdownReason},
        consumer::{Consumer, Delivery, ReturnedMessage},
        error::Error,
        events::EventRegistry,
        Result,
    },
    frame::{
        AmqpChannelId, ChannelClose, ChannelCloseOk, ChannelFlow, ChannelFlowOk, ChannelOpen,
        ChannelOpenOk, Frame, Method, MethodId,
    },
    net::{self, ChannelResource, ManagementCommand, OutgoingMessage},
};

mod basic;
mod consumer_dispatcher;
mod continuation;
mod dispatcher;
mod exchange;
mod queue;

pub use basic::*;
pub use exchange::*;
pub use queue::*;

pub(crate) use consumer_dispatcher::ConsumerJob;
use consumer_dispatcher::ConsumerDispatcher;
use continuation::{ContinuationRegistry, Reply};
use dispatcher::ChannelDispatcher;

/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Asynchronous notifications of a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Shutdown(ShutdownReason),
    /// `channel.flow` from the server
    FlowChanged(bool),
    /// the consumer with this tag was cancelled, by the client or by the server
    ConsumerCancelled(String),
    /// a `mandatory` or `immediate` message the server could not route
    Returned(ReturnedMessage),
    /// a delivery for a consumer tag without registration, e.g. one that
    /// arrived after a `no_wait` cancel. It stays unacknowledged until it is
    /// acked, nacked or rejected, or the channel closes.
    UnhandledDelivery(Delivery),
}

pub(crate) struct ConsumerRegistration {
    pub consumer: Arc<dyn Consumer>,
    pub queue: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Discards the pending continuation if the caller stops waiting for it,
/// e.g. on timeout or when the calling future is dropped.
struct PendingContinuation<'a> {
    registry: &'a ContinuationRegistry,
    sent: bool,
}

impl Drop for PendingContinuation<'_> {
    fn drop(&mut self) {
        self.registry.cancel(self.sent);
    }
}

/// AMQP channel handle. Cheap to clone, all clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<SharedChannelInner>,
}

pub(crate) struct SharedChannelInner {
    channel_id: AmqpChannelId,
    outgoing_tx: mpsc::Sender<OutgoingMessage>,
    mgmt_tx: mpsc::UnboundedSender<ManagementCommand>,
    /// shutdown reason of the owning connection
    conn_shutdown: watch::Receiver<Option<ShutdownReason>>,
    frame_max: u32,
    continuation_timeout: Duration,
    concurrency: usize,

    state: Mutex<ChannelState>,
    close_reason: Mutex<Option<(ShutdownReason, Error)>>,
    /// serializes synchronous requests
    rpc_lock: tokio::sync::Mutex<()>,
    continuations: ContinuationRegistry,

    consumers: Mutex<HashMap<String, ConsumerRegistration>>,
    consumer_tx: mpsc::UnboundedSender<ConsumerJob>,
    consumer_seq: AtomicU64,

    flow: AtomicBool,
    events: EventRegistry<ChannelEvent>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.channel_id)
            .field("state", &self.state())
            .field("concurrency", &self.shared.concurrency)
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shared.channel_id)
    }
}

impl Channel {
    /// Allocates a channel id, starts the dispatchers and negotiates
    /// `channel.open`.
    pub(crate) async fn open(conn: &SharedConnectionInner, concurrency: usize) -> Result<Self> {
        let (dispatcher_tx, dispatcher_rx) = mpsc::unbounded_channel();
        let channel_id =
            match net::register_channel_resource(&conn.mgmt_tx, ChannelResource { dispatcher_tx })
                .await
            {
                Some(id) => id,
                None if conn.is_open() => {
                    return Err(Error::ChannelLimitExceeded(conn.tuning.channel_max))
                }
                None => {
                    return Err(Error::ConnectionClosedError(
                        "connection is not open".to_owned(),
                    ))
                }
            };

        let (consumer_tx, consumer_rx) = mpsc::unbounded_channel();
        let channel = Self {
            shared: Arc::new(SharedChannelInner {
                channel_id,
                outgoing_tx: conn.outgoing_tx.clone(),
                mgmt_tx: conn.mgmt_tx.clone(),
                conn_shutdown: conn.shutdown_rx.clone(),
                frame_max: conn.tuning.frame_max,
                continuation_timeout: conn.continuation_timeout,
                concurrency,
                state: Mutex::new(ChannelState::Opening),
                close_reason: Mutex::new(None),
                rpc_lock: tokio::sync::Mutex::new(()),
                continuations: ContinuationRegistry::default(),
                consumers: Mutex::new(HashMap::new()),
                consumer_tx,
                consumer_seq: AtomicU64::new(0),
                flow: AtomicBool::new(true),
                events: EventRegistry::new(),
            }),
        };
        ChannelDispatcher::new(channel.clone(), dispatcher_rx).spawn();
        ConsumerDispatcher::new(channel.clone(), consumer_rx, concurrency).spawn();

        match channel
            .request(ChannelOpen::default().into(), &[ChannelOpenOk::ID], false)
            .await
        {
            Ok(_) => {
                *lock(&channel.shared.state) = ChannelState::Open;
                info!(
                    "open channel {} with consumer concurrency {}",
                    channel_id, concurrency
                );
                Ok(channel)
            }
            Err(err) => {
                channel.finish(ShutdownReason::application(), err.clone(), true);
                Err(err)
            }
        }
    }

    pub fn channel_id(&self) -> AmqpChannelId {
        self.shared.channel_id
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.shared.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open && self.shared.conn_shutdown.borrow().is_none()
    }

    /// `None` until the channel is closed.
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        lock(&self.shared.close_reason)
            .as_ref()
            .map(|(reason, _)| reason.clone())
    }

    /// The channel was closed on its own, by the application or the server,
    /// rather than as part of its connection's shutdown.
    pub(crate) fn closed_by_channel_close(&self) -> bool {
        matches!(
            lock(&self.shared.close_reason).as_ref(),
            Some((_, Error::ChannelClosedError(_)))
        )
    }

    /// Last flow state requested by the server, `true` unless paused.
    pub fn is_flow_active(&self) -> bool {
        self.shared.flow.load(Ordering::Acquire)
    }

    /// Number of deliveries this channel hands to consumers concurrently.
    pub fn consumer_concurrency(&self) -> usize {
        self.shared.concurrency
    }

    pub fn events(&self) -> &EventRegistry<ChannelEvent> {
        &self.shared.events
    }

    pub(crate) fn frame_max(&self) -> u32 {
        self.shared.frame_max
    }

    fn check_open(&self) -> Result<()> {
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Closed => {
                return Err(match lock(&self.shared.close_reason).as_ref() {
                    Some((_, err)) => err.clone(),
                    None => Error::ChannelClosedError("channel is closed".to_owned()),
                })
            }
            ChannelState::Closing => {
                return Err(Error::ChannelClosedError("channel is closing".to_owned()))
            }
            ChannelState::Opening => {
                return Err(Error::ChannelUseError("channel is not open yet".to_owned()))
            }
        }
        if let Some(reason) = self.shared.conn_shutdown.borrow().as_ref() {
            return Err(Error::ConnectionClosedError(reason.to_string()));
        }
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.shared.outgoing_tx.send(message).await.map_err(|_| {
            Error::ConnectionClosedError(format!(
                "connection stopped, cannot send on channel {}",
                self.shared.channel_id
            ))
        })
    }

    /// Send a synchronous request and wait for one of `expected` in reply.
    pub(crate) async fn call(
        &self,
        method: impl Into<Method>,
        expected: &'static [MethodId],
    ) -> Result<Reply> {
        self.request(method.into(), expected, true).await
    }

    async fn request(
        &self,
        method: Method,
        expected: &'static [MethodId],
        require_open: bool,
    ) -> Result<Reply> {
        let _rpc = self.shared.rpc_lock.lock().await;
        if require_open {
            self.check_open()?;
        }
        let responder_rx = self.shared.continuations.register(expected)?;
        let mut pending = PendingContinuation {
            registry: &self.shared.continuations,
            sent: false,
        };

        let id = method.id();
        self.send(OutgoingMessage::Frame(self.channel_id(), method.into()))
            .await?;
        pending.sent = true;

        let timeout = self.shared.continuation_timeout;
        match time::timeout(timeout, responder_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::ConnectionClosedError(format!(
                "channel {} stopped before replying to {}",
                self.shared.channel_id, id
            ))),
            Err(_) => {
                warn!(
                    "no reply to {} on channel {} within {:?}",
                    id, self.shared.channel_id, timeout
                );
                Err(Error::TimeoutError(format!(
                    "no reply to {} on channel {} within {:?}",
                    id, self.shared.channel_id, timeout
                )))
            }
        }
    }

    /// Send a method that gets no reply.
    pub(crate) async fn cast(&self, method: impl Into<Method>) -> Result<()> {
        self.check_open()?;
        self.send(OutgoingMessage::Frame(
            self.channel_id(),
            Frame::Method(method.into()),
        ))
        .await
    }

    /// Frames that must reach the server back to back.
    pub(crate) async fn cast_batch(&self, frames: Vec<Frame>) -> Result<()> {
        self.check_open()?;
        self.send(OutgoingMessage::Batch(self.channel_id(), frames))
            .await
    }

    /// Ask the server to pause (`false`) or resume (`true`) deliveries.
    /// Returns the flow state confirmed by the server.
    pub async fn flow(&self, active: bool) -> Result<bool> {
        let reply = self.call(ChannelFlow { active }, &[ChannelFlowOk::ID]).await?;
        let flow_ok = get_expected_method!(reply.method, Method::ChannelFlowOk)?;
        Ok(flow_ok.active)
    }

    /// Close the channel.
    ///
    /// Waits for `close-ok` up to the continuation timeout; the channel is
    /// closed afterwards whether or not the server replied. Closing a closed
    /// channel does nothing.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                ChannelState::Closing | ChannelState::Closed => return Ok(()),
                _ => *state = ChannelState::Closing,
            }
        }
        if self.shared.conn_shutdown.borrow().is_none() {
            let res = self
                .request(ChannelClose::normal().into(), &[ChannelCloseOk::ID], false)
                .await;
            if let Err(err) = res {
                debug!(
                    "channel {} closed without close-ok, cause: {}",
                    self.shared.channel_id, err
                );
            }
        }
        self.finish(
            ShutdownReason::application(),
            Error::ChannelClosedError("channel closed by application".to_owned()),
            true,
        );
        Ok(())
    }

    /// Moves the channel to `Closed` once: fails the pending request, stops
    /// the consumer dispatcher and gives the channel id back.
    pub(crate) fn finish(&self, reason: ShutdownReason, err: Error, deregister: bool) {
        {
            let mut state = lock(&self.shared.state);
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        info!("channel {} closed, {}", self.shared.channel_id, reason);
        *lock(&self.shared.close_reason) = Some((reason.clone(), err.clone()));
        self.shared.continuations.close(err);
        if self
            .shared
            .consumer_tx
            .send(ConsumerJob::Shutdown(reason.clone()))
            .is_err()
        {
            debug!(
                "consumer dispatcher of channel {} already stopped",
                self.shared.channel_id
            );
        }
        if deregister {
            let cmd = ManagementCommand::DeregisterChannelResource(self.shared.channel_id);
            if self.shared.mgmt_tx.send(cmd).is_err() {
                debug!("connection already stopped");
            }
        }
        self.shared.events.emit(&ChannelEvent::Shutdown(reason));
    }

    /// Resolve the pending request with `reply`, gives it back if nothing
    /// is waiting for it.
    fn resolve(&self, reply: Reply) -> std::result::Result<(), Reply> {
        self.shared.continuations.resolve(reply)
    }

    fn set_flow(&self, active: bool) {
        self.shared.flow.store(active, Ordering::Release);
    }

    pub(crate) fn connection_shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shared.conn_shutdown.borrow().clone()
    }

    ////////////////////////////////////////////////////////////////////////
    // consumer registrations

    fn next_consumer_tag(&self) -> String {
        format!(
            "warren.ctag-{}.{}",
            self.shared.channel_id,
            self.shared.consumer_seq.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn register_consumer(&self, tag: &str, registration: ConsumerRegistration) -> Result<()> {
        let mut consumers = lock(&self.shared.consumers);
        if consumers.contains_key(tag) {
            return Err(Error::ChannelUseError(format!(
                "consumer tag {} already in use on channel {}",
                tag, self.shared.channel_id
            )));
        }
        consumers.insert(tag.to_owned(), registration);
        Ok(())
    }

    fn find_consumer(&self, tag: &str) -> Option<Arc<dyn Consumer>> {
        lock(&self.shared.consumers)
            .get(tag)
            .map(|registration| registration.consumer.clone())
    }

    fn remove_consumer(&self, tag: &str) -> Option<ConsumerRegistration> {
        lock(&self.shared.consumers).remove(tag)
    }

    fn take_consumers(&self) -> Vec<(String, ConsumerRegistration)> {
        lock(&self.shared.consumers).drain().collect()
    }

    /// Tags of the active consumers.
    pub fn consumer_tags(&self) -> Vec<String> {
        lock(&self.shared.consumers).keys().cloned().collect()
    }

    fn queue_consumer_job(&self, job: ConsumerJob) {
        if self.shared.consumer_tx.send(job).is_err() {
            debug!(
                "consumer dispatcher of channel {} already stopped",
                self.shared.channel_id
            );
        }
    }
}
