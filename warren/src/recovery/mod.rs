//! Automatic connection recovery.
//!
//! [`RecoverableConnection`] wraps a [`Connection`] and replaces it when it
//! shuts down unexpectedly. A supervisor task watches the live connection;
//! on a shutdown not initiated by the application it reconnects following
//! the [`RecoveryBackoffPolicy`], trying the configured endpoints in turn.
//! After each successful reconnect:
//!
//! 1. every open [`RecoverableChannel`] gets a new channel with the same
//!    consumer concurrency
//! 2. exchanges, queues and bindings declared through recoverable channels
//!    are declared again, in their original order
//! 3. `basic.qos` and consumers are re-issued on their channel, consumers
//!    with their original tag
//!
//! While recovering, calls fail immediately with [`Error::NotConnected`].
//! When the policy runs out of attempts the state becomes
//! [`RecoveryState::Failed`] and [`RecoveryEvent::RecoveryFailed`] is
//! emitted; the connection stays down.
//!
//! # Example
//! ```rust,no_run
//! use warren::connection::OpenConnectionArguments;
//! use warren::recovery::{RecoverableConnection, RecoveryEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let args = OpenConnectionArguments::new("localhost", 5672, "guest", "guest");
//! let connection = RecoverableConnection::open(&args).await.unwrap();
//! connection.events().subscribe(|event: &RecoveryEvent| println!("{:?}", event));
//! let channel = connection.open_channel().await.unwrap();
//! // ... declare, consume, publish through `channel` ...
//! channel.close().await.unwrap();
//! connection.close().await.unwrap();
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use bytes::Bytes;
use tokio::{sync::watch, time};
use tracing::{debug, error, info, warn};

use crate::{
    api::{
        channel::{
            BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicGetArguments,
            BasicNackArguments, BasicPublishArguments, BasicQosArguments, BasicRejectArguments,
            Channel, ChannelEvent, ExchangeDeclareArguments, ExchangeDeleteArguments,
            QueueBindArguments, QueueDeclareArguments, QueueDeleteArguments,
            QueuePurgeArguments, QueueUnbindArguments,
        },
        connection::{wait_for_shutdown_reason, Connection, OpenConnectionArguments, ShutdownReason},
        consumer::{Consumer, GetMessage},
        error::Error,
        events::EventRegistry,
        Result,
    },
    frame::{AmqpChannelId, BasicProperties},
};

mod backoff;
mod topology;

pub use backoff::RecoveryBackoffPolicy;
use topology::TopologyJournal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Connected,
    Recovering,
    /// recovery gave up, terminal
    Failed,
    /// closed by the application, or lost with recovery disabled; terminal
    Closed,
}

#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    /// the underlying connection shut down
    ConnectionShutdown(ShutdownReason),
    RecoveryStarted,
    RecoverySucceeded {
        /// attempts made, the successful one included
        attempts: u32,
        endpoint: String,
    },
    RecoveryFailed(Error),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// `link_lost` is set once the connection in use went down for a reason
/// recovery will act on, possibly before `Recovering` is published.
fn check_connected(state: RecoveryState, link_lost: bool) -> Result<()> {
    match state {
        RecoveryState::Recovering => Err(Error::NotConnected),
        RecoveryState::Connected if link_lost => Err(Error::NotConnected),
        _ => Ok(()),
    }
}

fn awaits_recovery(automatic_recovery: bool, reason: Option<ShutdownReason>) -> bool {
    automatic_recovery && reason.map_or(false, |reason| !reason.is_application_initiated())
}

/////////////////////////////////////////////////////////////////////////////

/// Connection handle that survives network failures. Cheap to clone.
#[derive(Clone)]
pub struct RecoverableConnection {
    shared: Arc<RecoveryShared>,
}

struct RecoveryShared {
    args: OpenConnectionArguments,
    current: Mutex<Connection>,
    /// first endpoint to try on the next attempt
    endpoint_cursor: AtomicUsize,
    closed: AtomicBool,
    state_tx: watch::Sender<RecoveryState>,
    topology: Arc<Mutex<TopologyJournal>>,
    channels: Mutex<Vec<Weak<RecoverableChannelInner>>>,
    events: EventRegistry<RecoveryEvent>,
}

impl fmt::Display for RecoverableConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:?}]",
            self.current().connection_name(),
            self.state()
        )
    }
}

impl RecoverableConnection {
    /// Open the first connection. Recovery only applies to connections that
    /// were established once, a failure here is returned as is.
    pub async fn open(args: &OpenConnectionArguments) -> Result<Self> {
        let (conn, idx) = Connection::open_from(args, 0).await?;
        let shutdown_rx = conn.shutdown_watch();
        let (state_tx, _) = watch::channel(RecoveryState::Connected);
        let shared = Arc::new(RecoveryShared {
            args: args.clone(),
            current: Mutex::new(conn),
            endpoint_cursor: AtomicUsize::new(idx),
            closed: AtomicBool::new(false),
            state_tx,
            topology: Arc::new(Mutex::new(TopologyJournal::default())),
            channels: Mutex::new(Vec::new()),
            events: EventRegistry::new(),
        });
        tokio::spawn(supervise(Arc::downgrade(&shared), shutdown_rx));
        Ok(Self { shared })
    }

    pub fn state(&self) -> RecoveryState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver of every state change.
    pub fn state_watch(&self) -> watch::Receiver<RecoveryState> {
        self.shared.state_tx.subscribe()
    }

    pub fn events(&self) -> &EventRegistry<RecoveryEvent> {
        &self.shared.events
    }

    pub fn is_open(&self) -> bool {
        self.state() == RecoveryState::Connected && self.current().is_open()
    }

    /// The connection currently in use, replaced on every recovery.
    pub fn connection(&self) -> Result<Connection> {
        let current = self.current();
        let link_lost = !self.shared.is_closed()
            && awaits_recovery(self.shared.args.automatic_recovery, current.shutdown_reason());
        check_connected(self.state(), link_lost)?;
        Ok(current)
    }

    fn current(&self) -> Connection {
        lock(&self.shared.current).clone()
    }

    pub async fn open_channel(&self) -> Result<RecoverableChannel> {
        let concurrency = self.shared.args.consumer_dispatch_concurrency;
        self.open_channel_with_concurrency(concurrency).await
    }

    /// See [`Connection::open_channel_with_concurrency`].
    pub async fn open_channel_with_concurrency(
        &self,
        concurrency: usize,
    ) -> Result<RecoverableChannel> {
        let channel = self
            .connection()?
            .open_channel_with_concurrency(concurrency)
            .await?;
        let inner = Arc::new(RecoverableChannelInner {
            concurrency: channel.consumer_concurrency(),
            current: Mutex::new(channel.clone()),
            state_rx: self.shared.state_tx.subscribe(),
            automatic_recovery: self.shared.args.automatic_recovery,
            topology: self.shared.topology.clone(),
            qos: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events: EventRegistry::new(),
        });
        forward_events(&inner, &channel);
        {
            let mut channels = lock(&self.shared.channels);
            channels.retain(|weak| weak.strong_count() > 0);
            channels.push(Arc::downgrade(&inner));
        }
        Ok(RecoverableChannel { inner })
    }

    /// Close the connection and stop recovering. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("close recoverable connection");
        self.shared.set_state(RecoveryState::Closed);
        self.current().close().await
    }
}

impl RecoveryShared {
    fn set_state(&self, state: RecoveryState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("recovery state {:?} -> {:?}", previous, state);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reconnect under the backoff policy. On success returns the shutdown
    /// watch of the new connection.
    async fn recover(&self) -> Result<watch::Receiver<Option<ShutdownReason>>> {
        let policy = self.args.recovery_backoff;
        let mut last_error =
            Error::BrokerUnreachableError("recovery policy allows no attempt".to_owned());

        for attempt in 1..=policy.max_attempts() {
            time::sleep(policy.delay_for(attempt)).await;
            if self.is_closed() {
                return Err(Error::ConnectionClosedError(
                    "closed by application during recovery".to_owned(),
                ));
            }
            let start = self.endpoint_cursor.load(Ordering::Acquire);
            info!(
                "recovery attempt {}/{}",
                attempt,
                policy.max_attempts()
            );
            let (conn, idx) = match Connection::open_from(&self.args, start).await {
                Ok(opened) => opened,
                Err(err) => {
                    warn!("recovery attempt {} failed, cause: {}", attempt, err);
                    self.endpoint_cursor.store(start + 1, Ordering::Release);
                    last_error = err;
                    continue;
                }
            };
            // the next recovery starts with the endpoint after this one
            self.endpoint_cursor.store(idx + 1, Ordering::Release);

            if let Err(err) = self.restore(&conn).await {
                warn!(
                    "recovery attempt {} failed to restore topology, cause: {}",
                    attempt, err
                );
                if let Err(err) = conn.close().await {
                    debug!("failed to close half-recovered connection: {}", err);
                }
                last_error = err;
                continue;
            }
            if self.is_closed() {
                conn.close().await.ok();
                return Err(Error::ConnectionClosedError(
                    "closed by application during recovery".to_owned(),
                ));
            }

            let shutdown_rx = conn.shutdown_watch();
            let endpoint = conn.endpoint().to_owned();
            *lock(&self.current) = conn;
            self.events.emit(&RecoveryEvent::RecoverySucceeded {
                attempts: attempt,
                endpoint,
            });
            return Ok(shutdown_rx);
        }
        Err(last_error)
    }

    fn live_channels(&self) -> Vec<Arc<RecoverableChannelInner>> {
        let mut channels = lock(&self.channels);
        channels.retain(|weak| weak.strong_count() > 0);
        channels
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|inner| inner.needs_recovery())
            .collect()
    }

    async fn restore(&self, conn: &Connection) -> Result<()> {
        let channels = self.live_channels();
        let mut reopened = Vec::with_capacity(channels.len());
        for inner in channels {
            let channel = conn.open_channel_with_concurrency(inner.concurrency).await?;
            reopened.push((inner, channel));
        }

        let entities = lock(&self.topology).snapshot();
        let renames = topology::replay(&entities, conn).await?;
        lock(&self.topology).apply_renames(&renames);

        for (inner, channel) in reopened {
            restore_channel(&inner, channel, &renames).await?;
        }
        Ok(())
    }
}

/// Follows the live connection until it is closed for good.
async fn supervise(
    shared: Weak<RecoveryShared>,
    mut shutdown_rx: watch::Receiver<Option<ShutdownReason>>,
) {
    loop {
        let reason = wait_for_shutdown_reason(shutdown_rx).await;
        let Some(shared) = shared.upgrade() else {
            debug!("recoverable connection dropped, supervisor exits");
            return;
        };
        shared
            .events
            .emit(&RecoveryEvent::ConnectionShutdown(reason.clone()));

        if shared.is_closed() || reason.is_application_initiated() {
            shared.set_state(RecoveryState::Closed);
            return;
        }
        if !shared.args.automatic_recovery {
            info!("connection lost with recovery disabled, {}", reason);
            shared.set_state(RecoveryState::Closed);
            return;
        }

        info!("connection lost, start recovery, {}", reason);
        shared.set_state(RecoveryState::Recovering);
        shared.events.emit(&RecoveryEvent::RecoveryStarted);
        match shared.recover().await {
            Ok(rx) => {
                info!("connection recovered");
                shared.set_state(RecoveryState::Connected);
                shutdown_rx = rx;
            }
            Err(err) if shared.is_closed() => {
                debug!("recovery stopped, {}", err);
                shared.set_state(RecoveryState::Closed);
                return;
            }
            Err(err) => {
                error!("recovery failed, giving up, cause: {}", err);
                shared.set_state(RecoveryState::Failed);
                shared.events.emit(&RecoveryEvent::RecoveryFailed(err));
                return;
            }
        }
    }
}

/////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
struct RecordedConsumer {
    args: BasicConsumeArguments,
    consumer: Arc<dyn Consumer>,
}

/// Channel handle that moves to a new channel when its connection recovers.
/// Cheap to clone.
///
/// Declarations, bindings, `basic.qos` and consumers made through it are
/// recorded and restored after recovery. Deliveries after a recovery carry
/// delivery tags of the new channel: tags of earlier deliveries can no longer
/// be acked.
#[derive(Clone)]
pub struct RecoverableChannel {
    inner: Arc<RecoverableChannelInner>,
}

struct RecoverableChannelInner {
    concurrency: usize,
    current: Mutex<Channel>,
    state_rx: watch::Receiver<RecoveryState>,
    automatic_recovery: bool,
    topology: Arc<Mutex<TopologyJournal>>,
    qos: Mutex<Option<BasicQosArguments>>,
    /// in registration order
    consumers: Mutex<Vec<RecordedConsumer>>,
    closed: AtomicBool,
    events: EventRegistry<ChannelEvent>,
}

impl RecoverableChannelInner {
    fn needs_recovery(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !lock(&self.current).closed_by_channel_close()
    }

    fn forget_consumer(&self, consumer_tag: &str) {
        lock(&self.consumers).retain(|recorded| recorded.args.consumer_tag != consumer_tag);
    }
}

/// Moves `inner` onto `channel`: re-applies qos and re-registers consumers
/// with their original tags, following renamed queues.
async fn restore_channel(
    inner: &Arc<RecoverableChannelInner>,
    channel: Channel,
    renames: &HashMap<String, String>,
) -> Result<()> {
    forward_events(inner, &channel);
    let qos = lock(&inner.qos).clone();
    if let Some(qos) = qos {
        channel.basic_qos(qos).await?;
    }

    let consumers = {
        let mut consumers = lock(&inner.consumers);
        for recorded in consumers.iter_mut() {
            if let Some(new_name) = renames.get(&recorded.args.queue) {
                recorded.args.queue = new_name.clone();
            }
        }
        consumers.clone()
    };
    for recorded in consumers {
        debug!(
            "recover consumer {} on queue {}",
            recorded.args.consumer_tag, recorded.args.queue
        );
        channel
            .basic_consume_shared(recorded.consumer, recorded.args)
            .await?;
    }
    *lock(&inner.current) = channel;
    Ok(())
}

/// Re-emits the events of `channel` on the recoverable channel, and drops
/// recorded consumers once cancelled.
fn forward_events(inner: &Arc<RecoverableChannelInner>, channel: &Channel) {
    let weak = Arc::downgrade(inner);
    channel.events().subscribe(move |event: &ChannelEvent| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if let ChannelEvent::ConsumerCancelled(tag) = event {
            inner.forget_consumer(tag);
        }
        inner.events.emit(event);
    });
}

impl fmt::Display for RecoverableChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recoverable {}", lock(&self.inner.current))
    }
}

impl RecoverableChannel {
    /// The channel currently in use; `NotConnected` while recovering.
    pub fn channel(&self) -> Result<Channel> {
        let current = lock(&self.inner.current).clone();
        let link_lost =
            awaits_recovery(self.inner.automatic_recovery, current.connection_shutdown_reason());
        check_connected(*self.inner.state_rx.borrow(), link_lost)?;
        Ok(current)
    }

    /// Id of the current channel, it may change on recovery.
    pub fn channel_id(&self) -> AmqpChannelId {
        lock(&self.inner.current).channel_id()
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && *self.inner.state_rx.borrow() == RecoveryState::Connected
            && lock(&self.inner.current).is_open()
    }

    /// Events of every channel this handle moved through.
    pub fn events(&self) -> &EventRegistry<ChannelEvent> {
        &self.inner.events
    }

    pub fn consumer_concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Tags of the consumers restored on recovery.
    pub fn consumer_tags(&self) -> Vec<String> {
        lock(&self.inner.consumers)
            .iter()
            .map(|recorded| recorded.args.consumer_tag.clone())
            .collect()
    }

    pub async fn exchange_declare(&self, args: ExchangeDeclareArguments) -> Result<()> {
        self.channel()?.exchange_declare(args.clone()).await?;
        lock(&self.inner.topology).record_exchange(&args);
        Ok(())
    }

    pub async fn exchange_delete(&self, args: ExchangeDeleteArguments) -> Result<()> {
        let exchange = args.exchange.clone();
        self.channel()?.exchange_delete(args).await?;
        lock(&self.inner.topology).remove_exchange(&exchange);
        Ok(())
    }

    /// See [`Channel::queue_declare`]. A server-named queue declared with
    /// `no_wait` has no known name and is not restored.
    pub async fn queue_declare(
        &self,
        args: QueueDeclareArguments,
    ) -> Result<Option<(String, u32, u32)>> {
        let declared = self.channel()?.queue_declare(args.clone()).await?;
        let name = match declared {
            Some((ref name, _, _)) => name.clone(),
            None => args.queue.clone(),
        };
        if !name.is_empty() {
            lock(&self.inner.topology).record_queue(&args, &name);
        }
        Ok(declared)
    }

    pub async fn queue_bind(&self, args: QueueBindArguments) -> Result<()> {
        self.channel()?.queue_bind(args.clone()).await?;
        lock(&self.inner.topology).record_binding(&args);
        Ok(())
    }

    pub async fn queue_unbind(&self, args: QueueUnbindArguments) -> Result<()> {
        self.channel()?.queue_unbind(args.clone()).await?;
        lock(&self.inner.topology).remove_binding(
            &args.queue,
            &args.exchange,
            &args.routing_key,
            &args.arguments,
        );
        Ok(())
    }

    pub async fn queue_purge(&self, args: QueuePurgeArguments) -> Result<Option<u32>> {
        self.channel()?.queue_purge(args).await
    }

    pub async fn queue_delete(&self, args: QueueDeleteArguments) -> Result<Option<u32>> {
        let queue = args.queue.clone();
        let deleted = self.channel()?.queue_delete(args).await?;
        lock(&self.inner.topology).remove_queue(&queue);
        Ok(deleted)
    }

    /// Re-applied after every recovery.
    pub async fn basic_qos(&self, args: BasicQosArguments) -> Result<()> {
        self.channel()?.basic_qos(args.clone()).await?;
        *lock(&self.inner.qos) = Some(args);
        Ok(())
    }

    /// See [`Channel::basic_consume`]. The consumer is re-registered with
    /// the returned tag after every recovery, until cancelled.
    pub async fn basic_consume<C>(&self, consumer: C, args: BasicConsumeArguments) -> Result<String>
    where
        C: Consumer,
    {
        let consumer: Arc<dyn Consumer> = Arc::new(consumer);
        let mut args = args;
        let consumer_tag = self
            .channel()?
            .basic_consume_shared(consumer.clone(), args.clone())
            .await?;
        args.consumer_tag = consumer_tag.clone();
        lock(&self.inner.consumers).push(RecordedConsumer { args, consumer });
        Ok(consumer_tag)
    }

    pub async fn basic_cancel(&self, args: BasicCancelArguments) -> Result<String> {
        let consumer_tag = args.consumer_tag.clone();
        self.inner.forget_consumer(&consumer_tag);
        self.channel()?.basic_cancel(args).await
    }

    pub async fn basic_get(&self, args: BasicGetArguments) -> Result<Option<GetMessage>> {
        self.channel()?.basic_get(args).await
    }

    pub async fn basic_publish(
        &self,
        args: BasicPublishArguments,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<()> {
        self.channel()?.basic_publish(args, properties, body).await
    }

    pub async fn basic_ack(&self, args: BasicAckArguments) -> Result<()> {
        self.channel()?.basic_ack(args).await
    }

    pub async fn basic_nack(&self, args: BasicNackArguments) -> Result<()> {
        self.channel()?.basic_nack(args).await
    }

    pub async fn basic_reject(&self, args: BasicRejectArguments) -> Result<()> {
        self.channel()?.basic_reject(args).await
    }

    pub async fn flow(&self, active: bool) -> Result<bool> {
        self.channel()?.flow(active).await
    }

    /// Close the channel, it is no longer restored. Idempotent, and allowed
    /// while recovering.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.inner.consumers).clear();
        let channel = lock(&self.inner.current).clone();
        channel.close().await
    }
}
