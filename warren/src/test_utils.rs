//! Test helpers: log setup and a scripted in-process broker.
//!
//! [`MockBroker`] speaks enough AMQP 0-9-1 over loopback TCP to exercise the
//! client: handshake, channels, queue/exchange declares, bindings, routing
//! through the default exchange and direct bindings, consumers, basic.get and
//! returns. Tests can also make it misbehave: stay silent, delay replies on
//! a channel, drop or close every connection.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, Notify},
    task::JoinHandle,
    time,
};
use tracing::{debug, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    api::connection::OpenConnectionArguments,
    frame::{
        insert_field, long_str, short_str, str_field, AmqpChannelId, BasicCancel, BasicCancelOk,
        BasicConsumeOk, BasicDeliver, BasicGetEmpty, BasicGetOk, BasicProperties, BasicPublish,
        BasicQosOk, BasicReturn, ChannelClose, ChannelCloseOk, ChannelFlow, ChannelFlowOk,
        ChannelOpenOk, ConnectionBlocked, ConnectionClose, ConnectionCloseOk, ConnectionOpenOk,
        ConnectionStart, ConnectionTune, ConnectionUnblocked, ContentHeader, ExchangeDeclare,
        ExchangeDeclareOk, ExchangeDeleteOk, FieldTable, Frame, Method, MethodId, QueueBindOk,
        QueueDeclare, QueueDeclareOk, QueueDeleteOk, QueuePurgeOk, QueueUnbindOk, ShortStr,
        ACCESS_REFUSED, DEFAULT_CONN_CHANNEL, FRAME_OVERHEAD, NOT_FOUND, NO_ROUTE,
        PROTOCOL_HEADER,
    },
};

//////////////////////////////////////////////////////////////////
// construct a subscriber that prints formatted traces to stdout
pub fn setup_logging() {
    // global subscriber with log level according to RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

//////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// offered in connection.tune, 0 disables
    pub heartbeat: u16,
    pub channel_max: u16,
    pub frame_max: u32,
    /// answer start-ok with connection.close 403
    pub reject_auth: bool,
    /// send nothing at all once the connection is open
    pub silent: bool,
    /// requests never answered
    pub ignore: Vec<MethodId>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat: 0,
            channel_max: 2047,
            frame_max: 131_072,
            reject_auth: false,
            silent: false,
            ignore: vec![],
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn short(value: impl Into<String>) -> ShortStr {
    short_str(value).unwrap()
}

enum Outgoing {
    Frames(Vec<(AmqpChannelId, Frame)>),
    Shutdown,
}

type ConnectionId = u64;

struct ConnectionHandle {
    out_tx: mpsc::UnboundedSender<Outgoing>,
    kill: Arc<Notify>,
}

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Bytes,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<Message>,
    /// round-robin cursor over the queue's consumers
    next_consumer: usize,
}

struct ConsumerEntry {
    connection: ConnectionId,
    channel: AmqpChannelId,
    tag: String,
    queue: String,
}

#[derive(Default)]
struct Router {
    queues: HashMap<String, Queue>,
    exchanges: HashSet<String>,
    /// (queue, exchange, routing key)
    bindings: Vec<(String, String, String)>,
    consumers: Vec<ConsumerEntry>,
    delivery_tags: HashMap<(ConnectionId, AmqpChannelId), u64>,
    declared_queues: Vec<String>,
    declared_exchanges: Vec<String>,
    next_queue: u64,
    next_consumer: u64,
}

#[derive(Default)]
struct InFlight {
    current: usize,
    max: usize,
}

/// Delayed replies of one channel number, released in request order.
#[derive(Default)]
struct Release {
    last: Option<time::Instant>,
    queued: usize,
}

struct BrokerState {
    config: BrokerConfig,
    router: Mutex<Router>,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    delays: Mutex<HashMap<AmqpChannelId, Duration>>,
    releases: Mutex<HashMap<AmqpChannelId, Release>>,
    in_flight: Mutex<HashMap<AmqpChannelId, InFlight>>,
    accepted: AtomicUsize,
    heartbeats: AtomicUsize,
    next_connection: AtomicU64,
}

/// A broker serving on `127.0.0.1` on an ephemeral port. Stops when dropped.
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(config: BrokerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut router = Router::default();
        for exchange in ["", "amq.direct", "amq.fanout", "amq.topic"] {
            router.exchanges.insert(exchange.to_owned());
        }
        let state = Arc::new(BrokerState {
            config,
            router: Mutex::new(router),
            connections: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            releases: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            accepted: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
            next_connection: AtomicU64::new(1),
        });
        let accept_task = tokio::spawn(accept_loop(listener, state.clone()));
        debug!("mock broker listening on {}", addr);
        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// A port nothing listens on.
    pub async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_arguments(&self) -> OpenConnectionArguments {
        OpenConnectionArguments::new("127.0.0.1", self.port(), "guest", "guest")
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Heartbeat frames received from clients so far.
    pub fn heartbeats_received(&self) -> usize {
        self.state.heartbeats.load(Ordering::SeqCst)
    }

    /// Hold back replies on this channel number, on every connection.
    pub fn delay_replies(&self, channel: AmqpChannelId, delay: Duration) {
        lock(&self.state.delays).insert(channel, delay);
    }

    /// Most requests seen waiting for a reply at once on this channel number.
    pub fn max_in_flight(&self, channel: AmqpChannelId) -> usize {
        lock(&self.state.in_flight)
            .get(&channel)
            .map(|in_flight| in_flight.max)
            .unwrap_or(0)
    }

    /// Non-passive queue declares, server-generated names included, in order.
    pub fn declared_queues(&self) -> Vec<String> {
        lock(&self.state.router).declared_queues.clone()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        lock(&self.state.router).declared_exchanges.clone()
    }

    /// Tags of the consumers registered on every connection.
    pub fn consumer_tags(&self) -> Vec<String> {
        lock(&self.state.router)
            .consumers
            .iter()
            .map(|consumer| consumer.tag.clone())
            .collect()
    }

    /// Close every socket without any AMQP close handshake.
    pub fn drop_connections(&self) {
        for handle in lock(&self.state.connections).values() {
            handle.kill.notify_one();
        }
    }

    /// Send connection.close with this reply to every connection.
    pub fn close_connections(&self, reply_code: u16, reply_text: &str) {
        let close = ConnectionClose {
            reply_code,
            reply_text: short(reply_text),
            class_id: 0,
            method_id: 0,
        };
        self.state
            .broadcast(DEFAULT_CONN_CHANNEL, close.into_frame());
    }

    /// Send channel.flow on this channel number of every connection.
    pub fn send_flow(&self, channel: AmqpChannelId, active: bool) {
        self.state
            .broadcast(channel, ChannelFlow { active }.into_frame());
    }

    /// Push a delivery for `consumer_tag` on this channel number of every
    /// connection, whether or not such a consumer exists.
    pub fn send_delivery(&self, channel: AmqpChannelId, consumer_tag: &str, body: &'static [u8]) {
        let deliver = BasicDeliver {
            consumer_tag: short(consumer_tag),
            delivery_tag: 1,
            redelivered: false,
            exchange: ShortStr::default(),
            routing_key: short("stray"),
        };
        let frames: Vec<(AmqpChannelId, Frame)> = with_content(
            deliver,
            BasicProperties::default(),
            Bytes::from_static(body),
            self.state.config.frame_max,
        )
        .into_iter()
        .map(|frame| (channel, frame))
        .collect();
        for handle in lock(&self.state.connections).values() {
            handle.out_tx.send(Outgoing::Frames(frames.clone())).ok();
        }
    }

    /// `connection.blocked` with `reason`, or `connection.unblocked` for `None`.
    pub fn send_blocked(&self, reason: Option<&str>) {
        let frame = match reason {
            Some(reason) => ConnectionBlocked {
                reason: short(reason),
            }
            .into_frame(),
            None => ConnectionUnblocked {}.into_frame(),
        };
        self.state.broadcast(DEFAULT_CONN_CHANNEL, frame);
    }

    /// Stop accepting connections and drop the open ones.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BrokerState {
    fn send(&self, connection: ConnectionId, frames: Vec<(AmqpChannelId, Frame)>) {
        if let Some(handle) = lock(&self.connections).get(&connection) {
            handle.out_tx.send(Outgoing::Frames(frames)).ok();
        }
    }

    fn broadcast(&self, channel: AmqpChannelId, frame: Frame) {
        for handle in lock(&self.connections).values() {
            handle
                .out_tx
                .send(Outgoing::Frames(vec![(channel, frame.clone())]))
                .ok();
        }
    }

    fn begin_request(&self, channel: AmqpChannelId) {
        let mut in_flight = lock(&self.in_flight);
        let entry = in_flight.entry(channel).or_default();
        entry.current += 1;
        entry.max = entry.max.max(entry.current);
    }

    fn end_request(&self, channel: AmqpChannelId) {
        if let Some(entry) = lock(&self.in_flight).get_mut(&channel) {
            entry.current = entry.current.saturating_sub(1);
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<BrokerState>) {
    while let Ok((stream, peer)) = listener.accept().await {
        state.accepted.fetch_add(1, Ordering::SeqCst);
        let id = state.next_connection.fetch_add(1, Ordering::SeqCst);
        trace!("mock broker accepted {} as connection {}", peer, id);
        tokio::spawn(serve(state.clone(), id, stream));
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<Outgoing>) {
    let mut buf = BytesMut::new();
    while let Some(out) = out_rx.recv().await {
        match out {
            Outgoing::Frames(frames) => {
                for (channel, frame) in frames {
                    if let Err(err) = frame.encode(channel, &mut buf) {
                        debug!("mock broker failed to encode frame: {}", err);
                    }
                }
                if writer.write_all(&buf).await.is_err() {
                    break;
                }
                buf.clear();
            }
            Outgoing::Shutdown => break,
        }
    }
    writer.shutdown().await.ok();
}

struct FrameReader {
    reader: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    async fn protocol_header(&mut self) -> Option<[u8; 8]> {
        let mut header = [0u8; 8];
        self.reader.read_exact(&mut header).await.ok()?;
        Some(header)
    }

    /// `None` once the client is gone or sent garbage.
    async fn next(&mut self) -> Option<(AmqpChannelId, Frame)> {
        loop {
            match Frame::decode(&self.buf, 0) {
                Ok(Some((len, channel, frame))) => {
                    let _ = self.buf.split_to(len);
                    return Some((channel, frame));
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("mock broker failed to decode frame: {}", err);
                    return None;
                }
            }
            match self.reader.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn next_method(&mut self) -> Option<Method> {
        loop {
            match self.next().await? {
                (_, Frame::Method(method)) => return Some(method),
                (_, Frame::Heartbeat) => continue,
                (_, other) => {
                    debug!("mock broker got {:?} during handshake", other);
                    return None;
                }
            }
        }
    }
}

async fn serve(state: Arc<BrokerState>, id: ConnectionId, stream: TcpStream) {
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, out_rx));
    let kill = Arc::new(Notify::new());
    lock(&state.connections).insert(
        id,
        ConnectionHandle {
            out_tx: out_tx.clone(),
            kill: kill.clone(),
        },
    );

    let mut session = Session {
        state: state.clone(),
        id,
        out_tx: out_tx.clone(),
        reader: FrameReader {
            reader,
            buf: BytesMut::new(),
        },
        closed_channels: HashSet::new(),
        pending: HashMap::new(),
    };
    tokio::select! {
        _ = kill.notified() => debug!("mock broker drops connection {}", id),
        _ = session.run() => debug!("mock broker connection {} finished", id),
    }

    lock(&state.connections).remove(&id);
    {
        let mut router = lock(&state.router);
        router.consumers.retain(|consumer| consumer.connection != id);
        router.delivery_tags.retain(|(connection, _), _| *connection != id);
    }
    out_tx.send(Outgoing::Shutdown).ok();
}

struct PendingPublish {
    publish: BasicPublish,
    properties: BasicProperties,
    body_size: u64,
    body: BytesMut,
}

struct Session {
    state: Arc<BrokerState>,
    id: ConnectionId,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    reader: FrameReader,
    /// closed by the broker, waiting for close-ok
    closed_channels: HashSet<AmqpChannelId>,
    pending: HashMap<AmqpChannelId, PendingPublish>,
}

/// Method followed by its content, body split by `frame_max`.
fn with_content(
    method: impl Into<Method>,
    properties: BasicProperties,
    body: Bytes,
    frame_max: u32,
) -> Vec<Frame> {
    let mut frames = vec![
        Frame::Method(method.into()),
        Frame::ContentHeader(ContentHeader::new(body.len() as u64, properties)),
    ];
    let chunk_size = match frame_max as usize {
        0 => usize::MAX,
        max => max - FRAME_OVERHEAD,
    };
    let mut rest = body;
    while !rest.is_empty() {
        frames.push(Frame::ContentBody(rest.split_to(chunk_size.min(rest.len()))));
    }
    frames
}

impl Session {
    fn write(&self, channel: AmqpChannelId, frames: Vec<Frame>) {
        let frames = frames.into_iter().map(|frame| (channel, frame)).collect();
        self.out_tx.send(Outgoing::Frames(frames)).ok();
    }

    /// Reply to a synchronous request, honouring the channel's reply delay.
    /// Replies on a channel keep their request order even when the delay
    /// changes in between.
    fn respond(&self, channel: AmqpChannelId, method: impl Into<Method>) {
        self.state.begin_request(channel);
        let frame = Frame::Method(method.into());
        let delay = lock(&self.state.delays)
            .get(&channel)
            .copied()
            .unwrap_or_default();

        let mut releases = lock(&self.state.releases);
        let release = releases.entry(channel).or_default();
        if delay.is_zero() && release.queued == 0 {
            drop(releases);
            self.write(channel, vec![frame]);
            self.state.end_request(channel);
            return;
        }
        let mut send_at = time::Instant::now() + delay;
        if let Some(last) = release.last {
            send_at = send_at.max(last + Duration::from_millis(1));
        }
        release.last = Some(send_at);
        release.queued += 1;
        drop(releases);

        let state = self.state.clone();
        let out_tx = self.out_tx.clone();
        tokio::spawn(async move {
            time::sleep_until(send_at).await;
            // before the reply goes out, the next request may follow it
            state.end_request(channel);
            let mut releases = lock(&state.releases);
            out_tx
                .send(Outgoing::Frames(vec![(channel, frame)]))
                .ok();
            if let Some(release) = releases.get_mut(&channel) {
                release.queued -= 1;
            }
        });
    }

    fn close_channel(&mut self, channel: AmqpChannelId, reply_code: u16, reply_text: String, cause: MethodId) {
        self.closed_channels.insert(channel);
        self.pending.remove(&channel);
        lock(&self.state.router)
            .consumers
            .retain(|consumer| !(consumer.connection == self.id && consumer.channel == channel));
        let close = ChannelClose {
            reply_code,
            reply_text: short(reply_text),
            class_id: cause.class_id,
            method_id: cause.method_id,
        };
        self.write(channel, vec![close.into_frame()]);
    }

    async fn run(&mut self) {
        if !self.handshake().await {
            return;
        }
        let silent = self.state.config.silent;
        while let Some((channel, frame)) = self.reader.next().await {
            if silent {
                continue;
            }
            match frame {
                Frame::Heartbeat => {
                    self.state.heartbeats.fetch_add(1, Ordering::SeqCst);
                    self.write(DEFAULT_CONN_CHANNEL, vec![Frame::Heartbeat]);
                }
                Frame::Method(method) if channel == DEFAULT_CONN_CHANNEL => match method {
                    Method::ConnectionClose(_) => {
                        self.write(DEFAULT_CONN_CHANNEL, vec![ConnectionCloseOk {}.into_frame()]);
                        return;
                    }
                    Method::ConnectionCloseOk(_) => return,
                    other => debug!("mock broker ignores {} on channel 0", other.id()),
                },
                Frame::Method(Method::ChannelCloseOk(_)) => {
                    self.closed_channels.remove(&channel);
                }
                _ if self.closed_channels.contains(&channel) => {}
                Frame::Method(method) => self.handle_method(channel, method),
                Frame::ContentHeader(header) => {
                    let complete = match self.pending.get_mut(&channel) {
                        Some(pending) => {
                            pending.properties = header.properties;
                            pending.body_size = header.body_size;
                            header.body_size == 0
                        }
                        None => false,
                    };
                    if complete {
                        self.complete_publish(channel);
                    }
                }
                Frame::ContentBody(body) => {
                    let complete = match self.pending.get_mut(&channel) {
                        Some(pending) => {
                            pending.body.extend_from_slice(&body);
                            pending.body.len() as u64 >= pending.body_size
                        }
                        None => false,
                    };
                    if complete {
                        self.complete_publish(channel);
                    }
                }
            }
        }
    }

    async fn handshake(&mut self) -> bool {
        match self.reader.protocol_header().await {
            Some(header) if header == PROTOCOL_HEADER => {}
            _ => return false,
        }
        let mut capabilities = FieldTable::new();
        for capability in [
            "consumer_cancel_notify",
            "connection.blocked",
            "basic.nack",
            "publisher_confirms",
        ] {
            insert_field(&mut capabilities, capability, true).unwrap();
        }
        let mut server_properties = FieldTable::new();
        for (key, value) in [
            ("product", "mock-broker"),
            ("version", "0.1.0"),
            ("platform", "tokio"),
        ] {
            insert_field(&mut server_properties, key, str_field(value).unwrap()).unwrap();
        }
        insert_field(&mut server_properties, "capabilities", capabilities).unwrap();
        let start = ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: long_str("PLAIN AMQPLAIN").unwrap(),
            locales: long_str("en_US").unwrap(),
        };
        self.write(DEFAULT_CONN_CHANNEL, vec![start.into_frame()]);

        match self.reader.next_method().await {
            Some(Method::ConnectionStartOk(_)) => {}
            _ => return false,
        }
        if self.state.config.reject_auth {
            let close = ConnectionClose {
                reply_code: ACCESS_REFUSED,
                reply_text: short(
                    "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN",
                ),
                class_id: 10,
                method_id: 11,
            };
            self.write(DEFAULT_CONN_CHANNEL, vec![close.into_frame()]);
            // give the client a moment to read the close before the socket goes
            self.reader.next().await;
            return false;
        }

        let tune = ConnectionTune {
            channel_max: self.state.config.channel_max,
            frame_max: self.state.config.frame_max,
            heartbeat: self.state.config.heartbeat,
        };
        self.write(DEFAULT_CONN_CHANNEL, vec![tune.into_frame()]);
        match self.reader.next_method().await {
            Some(Method::ConnectionTuneOk(_)) => {}
            _ => return false,
        }
        match self.reader.next_method().await {
            Some(Method::ConnectionOpen(_)) => {}
            _ => return false,
        }
        self.write(DEFAULT_CONN_CHANNEL, vec![ConnectionOpenOk::default().into_frame()]);
        true
    }

    fn handle_method(&mut self, channel: AmqpChannelId, method: Method) {
        if self.state.config.ignore.contains(&method.id()) {
            trace!("mock broker ignores {} on channel {}", method.id(), channel);
            return;
        }
        match method {
            Method::ChannelOpen(_) => self.respond(channel, ChannelOpenOk::default()),
            Method::ChannelClose(_) => {
                self.pending.remove(&channel);
                {
                    let mut router = lock(&self.state.router);
                    router.consumers.retain(|consumer| {
                        !(consumer.connection == self.id && consumer.channel == channel)
                    });
                    router.delivery_tags.remove(&(self.id, channel));
                }
                self.respond(channel, ChannelCloseOk {});
            }
            Method::ChannelFlow(flow) => self.respond(channel, ChannelFlowOk { active: flow.active }),
            Method::ChannelFlowOk(_) => {}

            Method::ExchangeDeclare(declare) => {
                let exchange = declare.exchange.to_string();
                let exists = lock(&self.state.router).exchanges.contains(&exchange);
                if declare.passive() && !exists {
                    let text = format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange);
                    self.close_channel(channel, NOT_FOUND, text, ExchangeDeclare::ID);
                    return;
                }
                if !declare.passive() {
                    let mut router = lock(&self.state.router);
                    router.exchanges.insert(exchange.clone());
                    router.declared_exchanges.push(exchange);
                }
                if !declare.no_wait() {
                    self.respond(channel, ExchangeDeclareOk {});
                }
            }
            Method::ExchangeDelete(delete) => {
                {
                    let mut router = lock(&self.state.router);
                    router.exchanges.remove(delete.exchange.as_ref().as_str());
                    router
                        .bindings
                        .retain(|(_, exchange, _)| exchange != delete.exchange.as_ref().as_str());
                }
                if !delete.no_wait() {
                    self.respond(channel, ExchangeDeleteOk {});
                }
            }

            Method::QueueDeclare(declare) => {
                let reply = {
                    let mut router = lock(&self.state.router);
                    let name = if declare.queue.as_ref().is_empty() {
                        router.next_queue += 1;
                        format!("amq.gen-{}", router.next_queue)
                    } else {
                        declare.queue.to_string()
                    };
                    if declare.passive() && !router.queues.contains_key(&name) {
                        None
                    } else {
                        if !declare.passive() {
                            router.queues.entry(name.clone()).or_default();
                            router.declared_queues.push(name.clone());
                        }
                        let consumer_count =
                            router.consumers.iter().filter(|c| c.queue == name).count() as u32;
                        let message_count = router
                            .queues
                            .get(&name)
                            .map(|queue| queue.messages.len() as u32)
                            .unwrap_or(0);
                        Some(QueueDeclareOk {
                            queue: short(name),
                            message_count,
                            consumer_count,
                        })
                    }
                };
                match reply {
                    Some(declare_ok) if !declare.no_wait() => self.respond(channel, declare_ok),
                    Some(_) => {}
                    None => {
                        let text = format!("NOT_FOUND - no queue '{}' in vhost '/'", declare.queue);
                        self.close_channel(channel, NOT_FOUND, text, QueueDeclare::ID);
                    }
                }
            }
            Method::QueueBind(bind) => {
                {
                    let mut router = lock(&self.state.router);
                    let binding = (
                        bind.queue.to_string(),
                        bind.exchange.to_string(),
                        bind.routing_key.to_string(),
                    );
                    if !router.bindings.contains(&binding) {
                        router.bindings.push(binding);
                    }
                }
                if !bind.no_wait {
                    self.respond(channel, QueueBindOk {});
                }
            }
            Method::QueueUnbind(unbind) => {
                lock(&self.state.router).bindings.retain(|(queue, exchange, key)| {
                    !(queue == unbind.queue.as_ref().as_str()
                        && exchange == unbind.exchange.as_ref().as_str()
                        && key == unbind.routing_key.as_ref().as_str())
                });
                self.respond(channel, QueueUnbindOk {});
            }
            Method::QueuePurge(purge) => {
                let message_count = lock(&self.state.router)
                    .queues
                    .get_mut(purge.queue.as_ref().as_str())
                    .map(|queue| {
                        let count = queue.messages.len() as u32;
                        queue.messages.clear();
                        count
                    })
                    .unwrap_or(0);
                if !purge.no_wait {
                    self.respond(channel, QueuePurgeOk { message_count });
                }
            }
            Method::QueueDelete(delete) => {
                let message_count = self.delete_queue(delete.queue.as_ref());
                if !delete.no_wait() {
                    self.respond(channel, QueueDeleteOk { message_count });
                }
            }

            Method::BasicQos(_) => self.respond(channel, BasicQosOk {}),
            Method::BasicConsume(consume) => {
                let consumer_tag = {
                    let mut router = lock(&self.state.router);
                    let tag = if consume.consumer_tag.as_ref().is_empty() {
                        router.next_consumer += 1;
                        format!("amq.ctag-{}", router.next_consumer)
                    } else {
                        consume.consumer_tag.to_string()
                    };
                    router.queues.entry(consume.queue.to_string()).or_default();
                    router.consumers.push(ConsumerEntry {
                        connection: self.id,
                        channel,
                        tag: tag.clone(),
                        queue: consume.queue.to_string(),
                    });
                    tag
                };
                if !consume.no_wait() {
                    self.respond(
                        channel,
                        BasicConsumeOk {
                            consumer_tag: short(consumer_tag),
                        },
                    );
                }
                self.dispatch(consume.queue.as_ref());
            }
            Method::BasicCancel(cancel) => {
                lock(&self.state.router).consumers.retain(|consumer| {
                    !(consumer.connection == self.id && consumer.tag == cancel.consumer_tag.as_ref().as_str())
                });
                if !cancel.no_wait {
                    self.respond(
                        channel,
                        BasicCancelOk {
                            consumer_tag: cancel.consumer_tag,
                        },
                    );
                }
            }
            Method::BasicCancelOk(_) => {}
            Method::BasicGet(get) => self.basic_get(channel, get.queue.as_ref()),
            Method::BasicPublish(publish) => {
                self.pending.insert(
                    channel,
                    PendingPublish {
                        publish,
                        properties: BasicProperties::default(),
                        body_size: 0,
                        body: BytesMut::new(),
                    },
                );
            }
            Method::BasicAck(_) | Method::BasicNack(_) | Method::BasicReject(_) => {}
            other => debug!("mock broker ignores {} on channel {}", other.id(), channel),
        }
    }

    /// Removes the queue and its bindings, cancels its consumers. Returns
    /// the number of messages dropped.
    fn delete_queue(&self, name: &str) -> u32 {
        let (message_count, cancelled) = {
            let mut router = lock(&self.state.router);
            let message_count = router
                .queues
                .remove(name)
                .map(|queue| queue.messages.len() as u32)
                .unwrap_or(0);
            router.bindings.retain(|(queue, _, _)| queue != name);
            let mut cancelled = vec![];
            router.consumers.retain(|consumer| {
                if consumer.queue == name {
                    cancelled.push((consumer.connection, consumer.channel, consumer.tag.clone()));
                    false
                } else {
                    true
                }
            });
            (message_count, cancelled)
        };
        for (connection, channel, consumer_tag) in cancelled {
            let cancel = BasicCancel {
                consumer_tag: short(consumer_tag),
                no_wait: true,
            };
            self.state.send(connection, vec![(channel, cancel.into_frame())]);
        }
        message_count
    }

    fn basic_get(&self, channel: AmqpChannelId, queue: &str) {
        let frame_max = self.state.config.frame_max;
        let frames = {
            let mut router = lock(&self.state.router);
            let message = router
                .queues
                .get_mut(queue)
                .and_then(|queue| queue.messages.pop_front().map(|m| (m, queue.messages.len())));
            match message {
                Some((message, remaining)) => {
                    let delivery_tag = next_delivery_tag(&mut router, self.id, channel);
                    let get_ok = BasicGetOk {
                        delivery_tag,
                        redelivered: false,
                        exchange: short(message.exchange),
                        routing_key: short(message.routing_key),
                        message_count: remaining as u32,
                    };
                    with_content(get_ok, message.properties, message.body, frame_max)
                }
                None => vec![BasicGetEmpty::default().into_frame()],
            }
        };
        self.state.begin_request(channel);
        self.write(channel, frames);
        self.state.end_request(channel);
    }

    fn complete_publish(&mut self, channel: AmqpChannelId) {
        let Some(pending) = self.pending.remove(&channel) else {
            return;
        };
        let message = Message {
            exchange: pending.publish.exchange.to_string(),
            routing_key: pending.publish.routing_key.to_string(),
            properties: pending.properties,
            body: pending.body.freeze(),
        };
        let targets: Vec<String> = {
            let router = lock(&self.state.router);
            if message.exchange.is_empty() {
                router
                    .queues
                    .contains_key(&message.routing_key)
                    .then(|| message.routing_key.clone())
                    .into_iter()
                    .collect()
            } else {
                router
                    .bindings
                    .iter()
                    .filter(|(_, exchange, key)| {
                        *exchange == message.exchange && *key == message.routing_key
                    })
                    .map(|(queue, _, _)| queue.clone())
                    .collect()
            }
        };

        if targets.is_empty() {
            if pending.publish.mandatory() {
                let ret = BasicReturn {
                    reply_code: NO_ROUTE,
                    reply_text: short("NO_ROUTE"),
                    exchange: short(message.exchange),
                    routing_key: short(message.routing_key),
                };
                let frames =
                    with_content(ret, message.properties, message.body, self.state.config.frame_max);
                self.write(channel, frames);
            }
            return;
        }
        for target in targets {
            if let Some(queue) = lock(&self.state.router).queues.get_mut(&target) {
                queue.messages.push_back(message.clone());
            }
            self.dispatch(&target);
        }
    }

    /// Push the queue's messages to its consumers, round robin.
    fn dispatch(&self, queue_name: &str) {
        let frame_max = self.state.config.frame_max;
        let mut router = lock(&self.state.router);
        loop {
            let consumers: Vec<usize> = router
                .consumers
                .iter()
                .enumerate()
                .filter(|(_, consumer)| consumer.queue == queue_name)
                .map(|(idx, _)| idx)
                .collect();
            if consumers.is_empty() {
                return;
            }
            let Some(queue) = router.queues.get_mut(queue_name) else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            let pick = consumers[queue.next_consumer % consumers.len()];
            queue.next_consumer = queue.next_consumer.wrapping_add(1);

            let (connection, channel, consumer_tag) = {
                let consumer = &router.consumers[pick];
                (consumer.connection, consumer.channel, consumer.tag.clone())
            };
            let delivery_tag = next_delivery_tag(&mut router, connection, channel);
            let deliver = BasicDeliver {
                consumer_tag: short(consumer_tag),
                delivery_tag,
                redelivered: false,
                exchange: short(message.exchange),
                routing_key: short(message.routing_key),
            };
            let frames = with_content(deliver, message.properties, message.body, frame_max)
                .into_iter()
                .map(|frame| (channel, frame))
                .collect();
            self.state.send(connection, frames);
        }
    }
}

fn next_delivery_tag(router: &mut Router, connection: ConnectionId, channel: AmqpChannelId) -> u64 {
    let tag = router.delivery_tags.entry((connection, channel)).or_insert(0);
    *tag += 1;
    *tag
}
