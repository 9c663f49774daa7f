//! Implementation of AMQP_0-9-1's Connection class compatible with RabbitMQ.
//!
//! It provides [APIs][`Connection`] to manage an AMQP `Connection`.
//!
//! User should hold the connection object until no longer needs it, and call the [`close`] method
//! to gracefully shutdown the connection. When the last handle is dropped, it will try with best
//! effort to close the connection, but no guarantee to handle close errors.
//!
//! # Example
//! ```rust,no_run
//! use warren::connection::{Connection, OpenConnectionArguments};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let args = OpenConnectionArguments::new("localhost", 5672, "guest", "guest");
//! // open a connection with given arguments
//! let connection = Connection::open(&args).await.unwrap();
//!
//! // ... use the connection ...
//!
//! // gracefully shutdown the connection
//! connection.close().await.unwrap();
//! # }
//! ```
//! [`Connection`]: struct.Connection.html
//! [`close`]: struct.Connection.html#method.close

use std::{
    cell::RefCell,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    frame::{
        self, get_field, insert_field, short_str, str_field, AmqpChannelId, AmqpReplyCode,
        ConnectionClose, ConnectionOpen, ConnectionSecureOk, ConnectionStart, ConnectionStartOk,
        ConnectionTuneOk, FieldTable, FieldValue, Frame, Method, ACCESS_REFUSED,
        DEFAULT_CONN_CHANNEL, FRAME_ERROR, FRAME_MIN_SIZE, REPLY_SUCCESS,
    },
    net::{self, HandlerConfig, ManagementCommand, OutgoingMessage, SplitConnection},
    recovery::RecoveryBackoffPolicy,
};

use super::{
    channel::Channel,
    error::Error,
    events::EventRegistry,
    security::SecurityCredentials,
    Result,
};

const DEFAULT_LOCALE: &str = "en_US";
const OUTGOING_BUFFER_SIZE: usize = 1024;
/// channel_max of 0 means no limit, i.e. the whole id space
const CHANNEL_MAX_UNLIMITED: AmqpChannelId = u16::MAX;

/////////////////////////////////////////////////////////////////////////////

/// Who started the shutdown of a connection or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    Application,
    Peer,
    Library,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    ApplicationClose,
    PeerClose,
    NetworkError(String),
    ProtocolViolation(String),
    HeartbeatMissed,
}

/// Why a connection or a channel stopped.
///
/// `reply_code` and `reply_text` come from the close method exchanged with
/// the server, or describe the local failure when no close was exchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReason {
    pub initiator: ShutdownInitiator,
    pub cause: ShutdownCause,
    pub reply_code: AmqpReplyCode,
    pub reply_text: String,
}

impl ShutdownReason {
    pub fn application() -> Self {
        Self {
            initiator: ShutdownInitiator::Application,
            cause: ShutdownCause::ApplicationClose,
            reply_code: REPLY_SUCCESS,
            reply_text: "closed by application".to_owned(),
        }
    }

    pub fn peer(reply_code: AmqpReplyCode, reply_text: String) -> Self {
        Self {
            initiator: ShutdownInitiator::Peer,
            cause: ShutdownCause::PeerClose,
            reply_code,
            reply_text,
        }
    }

    pub fn network_error(msg: String) -> Self {
        Self {
            initiator: ShutdownInitiator::Library,
            cause: ShutdownCause::NetworkError(msg.clone()),
            reply_code: 0,
            reply_text: msg,
        }
    }

    pub fn protocol_violation(msg: String) -> Self {
        Self {
            initiator: ShutdownInitiator::Library,
            cause: ShutdownCause::ProtocolViolation(msg.clone()),
            reply_code: FRAME_ERROR,
            reply_text: msg,
        }
    }

    pub fn heartbeat_missed(timeout: Duration) -> Self {
        Self {
            initiator: ShutdownInitiator::Library,
            cause: ShutdownCause::HeartbeatMissed,
            reply_code: 0,
            reply_text: format!("missed heartbeats from server, timeout: {:?}", timeout),
        }
    }

    /// Only shutdowns the application asked for are final, everything else
    /// is a candidate for automatic recovery.
    pub fn is_application_initiated(&self) -> bool {
        self.initiator == ShutdownInitiator::Application
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "initiator: {:?}, code: {}, text: {}",
            self.initiator, self.reply_code, self.reply_text
        )
    }
}

/// Asynchronous notifications of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Shutdown(ShutdownReason),
    /// server stopped reading from the connection, e.g. because of a resource alarm
    Blocked(String),
    Unblocked,
}

/////////////////////////////////////////////////////////////////////////////

/// Properties announced by the server in `connection.start`.
#[derive(Debug, Clone, Default)]
pub struct ServerProperties {
    table: FieldTable,
}

impl ServerProperties {
    fn str_property(&self, key: &str) -> Option<&str> {
        match get_field(&self.table, key)? {
            FieldValue::S(value) => Some(value.as_ref().as_str()),
            _ => None,
        }
    }

    pub fn product(&self) -> Option<&str> {
        self.str_property("product")
    }

    pub fn version(&self) -> Option<&str> {
        self.str_property("version")
    }

    pub fn platform(&self) -> Option<&str> {
        self.str_property("platform")
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.str_property("cluster_name")
    }

    /// e.g. `consumer_cancel_notify`, `basic.nack`, `connection.blocked`
    pub fn has_capability(&self, name: &str) -> bool {
        match get_field(&self.table, "capabilities") {
            Some(FieldValue::F(caps)) => matches!(get_field(caps, name), Some(FieldValue::t(true))),
            _ => false,
        }
    }

    pub fn as_table(&self) -> &FieldTable {
        &self.table
    }
}

/// The arguments used by [`Connection::open`].
///
/// Setters can be chained, [`finish`](Self::finish) returns the value.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use warren::connection::OpenConnectionArguments;
///
/// let args = OpenConnectionArguments::new("localhost", 5672, "guest", "guest")
///     .add_endpoint("localhost", 5673)
///     .heartbeat(30)
///     .continuation_timeout(Duration::from_secs(5))
///     .finish();
/// ```
#[derive(Debug, Clone)]
pub struct OpenConnectionArguments {
    pub(crate) endpoints: Vec<String>,
    pub(crate) virtual_host: String,
    pub(crate) connection_name: Option<String>,
    pub(crate) credentials: SecurityCredentials,
    pub(crate) channel_max: AmqpChannelId,
    pub(crate) frame_max: u32,
    pub(crate) heartbeat: u16,
    pub(crate) missed_heartbeats: u32,
    pub(crate) handshake_timeout: Duration,
    pub(crate) continuation_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) consumer_dispatch_concurrency: usize,
    pub(crate) automatic_recovery: bool,
    pub(crate) recovery_backoff: RecoveryBackoffPolicy,
}

impl Default for OpenConnectionArguments {
    fn default() -> Self {
        Self::new("localhost", 5672, "guest", "guest")
    }
}

impl OpenConnectionArguments {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            endpoints: vec![format!("{}:{}", host, port)],
            virtual_host: "/".to_owned(),
            connection_name: None,
            credentials: SecurityCredentials::new_plain(username, password),
            channel_max: 2047,
            frame_max: 0,
            heartbeat: 60,
            missed_heartbeats: 2,
            handshake_timeout: Duration::from_secs(10),
            continuation_timeout: Duration::from_secs(20),
            shutdown_timeout: Duration::from_secs(5),
            consumer_dispatch_concurrency: 1,
            automatic_recovery: true,
            recovery_backoff: RecoveryBackoffPolicy::default(),
        }
    }

    /// Another candidate endpoint, tried in order after the ones already added.
    pub fn add_endpoint(&mut self, host: &str, port: u16) -> &mut Self {
        self.endpoints.push(format!("{}:{}", host, port));
        self
    }

    pub fn virtual_host(&mut self, virtual_host: &str) -> &mut Self {
        self.virtual_host = virtual_host.to_owned();
        self
    }

    pub fn connection_name(&mut self, connection_name: &str) -> &mut Self {
        self.connection_name = Some(connection_name.to_owned());
        self
    }

    pub fn credentials(&mut self, credentials: SecurityCredentials) -> &mut Self {
        self.credentials = credentials;
        self
    }

    /// 0 means no limit from the client side.
    pub fn channel_max(&mut self, channel_max: AmqpChannelId) -> &mut Self {
        self.channel_max = channel_max;
        self
    }

    /// 0 means no limit from the client side.
    pub fn frame_max(&mut self, frame_max: u32) -> &mut Self {
        self.frame_max = frame_max;
        self
    }

    /// Heartbeat interval in seconds, 0 disables heartbeats.
    pub fn heartbeat(&mut self, heartbeat: u16) -> &mut Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Number of heartbeat intervals without any inbound frame after which
    /// the connection is considered dead.
    pub fn missed_heartbeats(&mut self, missed_heartbeats: u32) -> &mut Self {
        self.missed_heartbeats = missed_heartbeats.max(1);
        self
    }

    pub fn handshake_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn continuation_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.continuation_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Default number of deliveries handled concurrently per channel.
    pub fn consumer_dispatch_concurrency(&mut self, concurrency: usize) -> &mut Self {
        self.consumer_dispatch_concurrency = concurrency.max(1);
        self
    }

    pub fn automatic_recovery(&mut self, enabled: bool) -> &mut Self {
        self.automatic_recovery = enabled;
        self
    }

    pub fn recovery_backoff(&mut self, policy: RecoveryBackoffPolicy) -> &mut Self {
        self.recovery_backoff = policy;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

/////////////////////////////////////////////////////////////////////////////

/// Parameters agreed with the server during `connection.tune`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tuning {
    pub channel_max: AmqpChannelId,
    /// 0 means no limit
    pub frame_max: u32,
    /// seconds, 0 means disabled
    pub heartbeat: u16,
}

/// For `channel_max` and `frame_max` zero means "no limit" on that side.
fn negotiate_limit<T: Ord + Default + Copy>(client: T, server: T) -> T {
    let zero = T::default();
    if client == zero {
        server
    } else if server == zero {
        client
    } else {
        client.min(server)
    }
}

fn negotiate_heartbeat(client: u16, server: u16) -> u16 {
    if client == 0 {
        0
    } else if server == 0 {
        client
    } else {
        client.min(server)
    }
}

pub(crate) fn negotiate_tuning(
    args: &OpenConnectionArguments,
    server: &frame::ConnectionTune,
) -> Tuning {
    let channel_max = match negotiate_limit(args.channel_max, server.channel_max) {
        0 => CHANNEL_MAX_UNLIMITED,
        n => n,
    };
    let frame_max = match negotiate_limit(args.frame_max, server.frame_max) {
        0 => 0,
        n => n.max(FRAME_MIN_SIZE),
    };
    Tuning {
        channel_max,
        frame_max,
        heartbeat: negotiate_heartbeat(args.heartbeat, server.heartbeat),
    }
}

/////////////////////////////////////////////////////////////////////////////

/// AMQP connection handle.
///
/// Cloning gives another handle to the same connection. When the last handle
/// is dropped without [`close`](Self::close), a `connection.close` is sent
/// with best effort.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<SharedConnectionInner>,
}

pub(crate) struct SharedConnectionInner {
    pub name: String,
    pub endpoint: String,
    pub server_properties: ServerProperties,
    pub tuning: Tuning,
    pub continuation_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub consumer_dispatch_concurrency: usize,
    pub outgoing_tx: mpsc::Sender<OutgoingMessage>,
    pub mgmt_tx: mpsc::UnboundedSender<ManagementCommand>,
    pub shutdown_rx: watch::Receiver<Option<ShutdownReason>>,
    close_requested: AtomicBool,
    events: Arc<EventRegistry<ConnectionEvent>>,
}

impl SharedConnectionInner {
    pub fn is_open(&self) -> bool {
        self.shutdown_rx.borrow().is_none()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown_rx.borrow().clone()
    }
}

impl Drop for SharedConnectionInner {
    fn drop(&mut self) {
        if self.close_requested.load(Ordering::Acquire) || !self.is_open() {
            return;
        }
        trace!("drop and close connection {}", self.name);
        let close = OutgoingMessage::Frame(
            DEFAULT_CONN_CHANNEL,
            ConnectionClose::normal().into_frame(),
        );
        if let Err(err) = self.outgoing_tx.try_send(close) {
            debug!("failed to close connection {} on drop: {}", self.name, err);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("endpoint", &self.shared.endpoint)
            .field("tuning", &self.shared.tuning)
            .finish()
    }
}

/// Maps a read error during the handshake.
fn handshake_read_error(err: net::Error) -> Error {
    match err {
        net::Error::FramingError(frame::Error::ProtocolMismatch(major, minor, revision)) => {
            Error::HandshakeError(format!(
                "server does not support AMQP 0-9-1, it offers {}-{}-{}",
                major, minor, revision
            ))
        }
        other => other.into(),
    }
}

/// Next method on channel 0, heartbeats are skipped.
async fn read_connection_method(conn: &mut SplitConnection) -> Result<Method> {
    loop {
        match conn.read_frame().await.map_err(handshake_read_error)? {
            (_, Frame::Heartbeat) => continue,
            (DEFAULT_CONN_CHANNEL, Frame::Method(method)) => return Ok(method),
            (channel_id, frame) => {
                return Err(Error::HandshakeError(format!(
                    "unexpected frame on channel {} during handshake: {:?}",
                    channel_id, frame
                )))
            }
        }
    }
}

fn client_properties(connection_name: &str) -> std::result::Result<FieldTable, frame::Error> {
    let mut capabilities = FieldTable::new();
    insert_field(&mut capabilities, "authentication_failure_close", true)?;
    insert_field(&mut capabilities, "connection.blocked", true)?;
    insert_field(&mut capabilities, "consumer_cancel_notify", true)?;
    insert_field(&mut capabilities, "basic.nack", true)?;

    let mut properties = FieldTable::new();
    insert_field(&mut properties, "product", str_field("warren")?)?;
    insert_field(&mut properties, "version", str_field(env!("CARGO_PKG_VERSION"))?)?;
    insert_field(&mut properties, "platform", str_field("Rust")?)?;
    insert_field(&mut properties, "capabilities", capabilities)?;
    insert_field(&mut properties, "connection_name", str_field(connection_name)?)?;
    Ok(properties)
}

fn close_during_handshake(close: frame::ConnectionClose) -> Error {
    let msg = format!("{}: {}", close.reply_code, close.reply_text);
    if close.reply_code == ACCESS_REFUSED {
        Error::AuthError(msg)
    } else {
        Error::HandshakeError(msg)
    }
}

impl Connection {
    /// Open and return a new AMQP connection.
    ///
    /// Endpoints are tried in order. Network failures move on to the next
    /// endpoint; handshake and authentication failures are returned as is.
    /// When every endpoint fails with a network error,
    /// [`Error::BrokerUnreachableError`] is returned.
    pub async fn open(args: &OpenConnectionArguments) -> Result<Self> {
        Self::open_from(args, 0).await.map(|(conn, _)| conn)
    }

    /// Tries endpoints starting at `start`, returns the connection and the
    /// index of the endpoint that succeeded.
    pub(crate) async fn open_from(
        args: &OpenConnectionArguments,
        start: usize,
    ) -> Result<(Self, usize)> {
        if args.endpoints.is_empty() {
            return Err(Error::BrokerUnreachableError(
                "no endpoint configured".to_owned(),
            ));
        }
        let total = args.endpoints.len();
        let mut failures = Vec::with_capacity(total);
        for offset in 0..total {
            let idx = (start + offset) % total;
            let endpoint = &args.endpoints[idx];
            match Self::open_endpoint(args, endpoint).await {
                Ok(conn) => return Ok((conn, idx)),
                Err(err) if err.is_network_related() => {
                    warn!("failed to connect to {}, cause: {}", endpoint, err);
                    failures.push(format!("{}: {}", endpoint, err));
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::BrokerUnreachableError(failures.join("; ")))
    }

    async fn open_endpoint(args: &OpenConnectionArguments, endpoint: &str) -> Result<Self> {
        let connection_name = match args.connection_name {
            Some(ref name) => name.clone(),
            None => generate_name(endpoint),
        };
        let handshake = async {
            let mut conn = SplitConnection::open(endpoint, args.handshake_timeout).await?;
            let (server_properties, tuning) =
                Self::handshake(&mut conn, args, &connection_name).await?;
            Ok::<_, Error>((conn, server_properties, tuning))
        };
        let (connection, server_properties, tuning) =
            match time::timeout(args.handshake_timeout, handshake).await {
                Ok(res) => res?,
                Err(_) => {
                    return Err(Error::TimeoutError(format!(
                        "handshake with {} not completed within {:?}",
                        endpoint, args.handshake_timeout
                    )))
                }
            };

        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER_SIZE);
        let (mgmt_tx, mgmt_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let events = Arc::new(EventRegistry::new());

        net::spawn_handlers(
            connection,
            HandlerConfig {
                channel_max: tuning.channel_max,
                heartbeat: match tuning.heartbeat {
                    0 => None,
                    secs => Some(Duration::from_secs(secs.into())),
                },
                missed_heartbeats: args.missed_heartbeats,
            },
            outgoing_tx.clone(),
            outgoing_rx,
            mgmt_tx.clone(),
            mgmt_rx,
            events.clone(),
            shutdown_tx,
        );

        info!(
            "open connection {} to {}, channel_max: {}, frame_max: {}, heartbeat: {}",
            connection_name, endpoint, tuning.channel_max, tuning.frame_max, tuning.heartbeat
        );

        Ok(Self {
            shared: Arc::new(SharedConnectionInner {
                name: connection_name,
                endpoint: endpoint.to_owned(),
                server_properties,
                tuning,
                continuation_timeout: args.continuation_timeout,
                shutdown_timeout: args.shutdown_timeout,
                consumer_dispatch_concurrency: args.consumer_dispatch_concurrency,
                outgoing_tx,
                mgmt_tx,
                shutdown_rx,
                close_requested: AtomicBool::new(false),
                events,
            }),
        })
    }

    async fn handshake(
        conn: &mut SplitConnection,
        args: &OpenConnectionArguments,
        connection_name: &str,
    ) -> Result<(ServerProperties, Tuning)> {
        // C: protocol-header
        conn.write_protocol_header().await?;

        // S: 'Start'
        let start: ConnectionStart = match read_connection_method(conn).await? {
            Method::ConnectionStart(start) => start,
            Method::ConnectionClose(close) => return Err(close_during_handshake(close)),
            other => {
                return Err(Error::HandshakeError(format!(
                    "expected connection.start, got {}",
                    other.id()
                )))
            }
        };
        if (start.version_major, start.version_minor) != (0, 9) {
            return Err(Error::HandshakeError(format!(
                "unsupported protocol version {}-{}",
                start.version_major, start.version_minor
            )));
        }
        if !args.credentials.is_offered(start.mechanisms.as_ref()) {
            return Err(Error::AuthError(format!(
                "mechanism {} is not offered by server: {}",
                args.credentials.get_mechanism_name(),
                start.mechanisms
            )));
        }
        let server_properties = ServerProperties {
            table: start.server_properties,
        };
        trace!("server properties: {:?}", server_properties);

        // C: 'StartOk'
        let start_ok = ConnectionStartOk {
            client_properties: client_properties(connection_name)?,
            mechanism: short_str(args.credentials.get_mechanism_name())?,
            response: args.credentials.get_response()?,
            locale: short_str(DEFAULT_LOCALE)?,
        };
        conn.write_frame(DEFAULT_CONN_CHANNEL, start_ok.into_frame())
            .await?;

        // S: 'Secure' or 'Tune'; the server closes the socket on bad credentials
        // unless it supports `authentication_failure_close`
        let tune = loop {
            let method = match read_connection_method(conn).await {
                Ok(method) => method,
                Err(Error::NetworkError(msg)) => {
                    return Err(Error::AuthError(format!(
                        "connection closed by server after start-ok, likely bad credentials: {}",
                        msg
                    )))
                }
                Err(err) => return Err(err),
            };
            match method {
                Method::ConnectionSecure(secure) => {
                    debug!("server sent connection.secure challenge");
                    let secure_ok = ConnectionSecureOk {
                        response: args.credentials.respond_to_challenge(secure.challenge.as_ref())?,
                    };
                    conn.write_frame(DEFAULT_CONN_CHANNEL, secure_ok.into_frame())
                        .await?;
                }
                Method::ConnectionTune(tune) => break tune,
                Method::ConnectionClose(close) => return Err(close_during_handshake(close)),
                other => {
                    return Err(Error::HandshakeError(format!(
                        "expected connection.tune, got {}",
                        other.id()
                    )))
                }
            }
        };

        // C: 'TuneOk'
        let tuning = negotiate_tuning(args, &tune);
        debug!("server tune: {:?}, negotiated: {:?}", tune, tuning);
        let tune_ok = ConnectionTuneOk {
            channel_max: tuning.channel_max,
            frame_max: tuning.frame_max,
            heartbeat: tuning.heartbeat,
        };
        conn.write_frame(DEFAULT_CONN_CHANNEL, tune_ok.into_frame())
            .await?;
        conn.set_frame_max(tuning.frame_max as usize);

        // C: 'Open'
        let open = ConnectionOpen {
            virtual_host: short_str(args.virtual_host.as_str())?,
            ..Default::default()
        };
        conn.write_frame(DEFAULT_CONN_CHANNEL, open.into_frame())
            .await?;

        // S: 'OpenOk'
        match read_connection_method(conn).await? {
            Method::ConnectionOpenOk(_) => Ok((server_properties, tuning)),
            Method::ConnectionClose(close) => Err(close_during_handshake(close)),
            other => Err(Error::HandshakeError(format!(
                "expected connection.open-ok, got {}",
                other.id()
            ))),
        }
    }

    /// Open a channel using the connection's default consumer dispatch concurrency.
    pub async fn open_channel(&self) -> Result<Channel> {
        self.open_channel_with_concurrency(self.shared.consumer_dispatch_concurrency)
            .await
    }

    /// Open a channel whose consumers handle up to `concurrency` deliveries
    /// at a time. 1 keeps deliveries strictly ordered.
    pub async fn open_channel_with_concurrency(&self, concurrency: usize) -> Result<Channel> {
        if !self.shared.is_open() {
            return Err(self.closed_error());
        }
        Channel::open(&self.shared, concurrency.max(1)).await
    }

    fn closed_error(&self) -> Error {
        match self.shared.shutdown_reason() {
            Some(reason) => Error::ConnectionClosedError(reason.to_string()),
            None => Error::ConnectionClosedError("connection is closing".to_owned()),
        }
    }

    /// Close the connection gracefully.
    ///
    /// Waits for `close-ok` up to the shutdown timeout, then tears the
    /// connection down regardless. Closing a closed connection does nothing.
    pub async fn close(&self) -> Result<()> {
        let shutdown_timeout = self.shared.shutdown_timeout;
        if self.shared.close_requested.swap(true, Ordering::AcqRel) || !self.is_open() {
            // already closing, wait for the first close to complete
            time::timeout(shutdown_timeout, self.wait_for_shutdown())
                .await
                .ok();
            return Ok(());
        }

        info!("close connection {}", self.shared.name);
        let close =
            OutgoingMessage::Frame(DEFAULT_CONN_CHANNEL, ConnectionClose::normal().into_frame());
        if let Err(err) = self.shared.outgoing_tx.send(close).await {
            debug!("connection {} already stopped: {}", self.shared.name, err);
        }

        if time::timeout(shutdown_timeout, self.wait_for_shutdown())
            .await
            .is_err()
        {
            warn!(
                "no close-ok from server within {:?}, force shutdown of connection {}",
                shutdown_timeout, self.shared.name
            );
            let cmd = ManagementCommand::Shutdown(ShutdownReason::application());
            if self.shared.mgmt_tx.send(cmd).is_err() {
                error!("connection {} handlers already gone", self.shared.name);
            }
            self.wait_for_shutdown().await;
        }
        Ok(())
    }

    /// Resolves once the connection is shut down, for whatever reason.
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        wait_for_shutdown_reason(self.shutdown_watch()).await
    }

    pub(crate) fn shutdown_watch(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.shared.shutdown_rx.clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// `None` while the connection is open.
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shared.shutdown_reason()
    }

    pub fn connection_name(&self) -> &str {
        &self.shared.name
    }

    /// `host:port` this connection is connected to.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn server_properties(&self) -> &ServerProperties {
        &self.shared.server_properties
    }

    pub fn channel_max(&self) -> AmqpChannelId {
        self.shared.tuning.channel_max
    }

    /// 0 means no limit.
    pub fn frame_max(&self) -> u32 {
        self.shared.tuning.frame_max
    }

    /// Negotiated heartbeat in seconds, 0 if disabled.
    pub fn heartbeat(&self) -> u16 {
        self.shared.tuning.heartbeat
    }

    /// Subscribe here for shutdown and blocked/unblocked notifications.
    pub fn events(&self) -> &EventRegistry<ConnectionEvent> {
        &self.shared.events
    }
}

pub(crate) async fn wait_for_shutdown_reason(
    mut rx: watch::Receiver<Option<ShutdownReason>>,
) -> ShutdownReason {
    loop {
        if let Some(reason) = rx.borrow_and_update().clone() {
            return reason;
        }
        if rx.changed().await.is_err() {
            return rx
                .borrow()
                .clone()
                .unwrap_or_else(ShutdownReason::application);
        }
    }
}

/// It is uncommon to have many connections for one client
/// We only need a simple algorithm to generate large enough number of unique names.
fn generate_name(domain: &str) -> String {
    const CHAR_SET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static CURSOR: RefCell<(usize, usize)> = RefCell::new((0, 0));
    }

    let max_len = CHAR_SET.len();
    let (head, tail) = CURSOR.with(|cursor| {
        let mut cursor = cursor.borrow_mut();
        let current = *cursor;
        cursor.1 = (cursor.1 + 1) % max_len;
        if cursor.1 == 0 {
            // head moves one step when and only when tail wraps
            cursor.0 = (cursor.0 + 1) % max_len;
        }
        current
    });

    format!(
        "{}{}_{}@{}",
        char::from(CHAR_SET[head]),
        char::from(CHAR_SET[tail]),
        COUNTER.fetch_add(1, Ordering::Relaxed),
        domain
    )
}
