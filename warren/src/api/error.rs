//! Error type can be returned by the APIs.

use crate::{frame, net};

use std::fmt;
use tokio::sync::{mpsc::error::SendError, oneshot::error::RecvError};

/// A list of errors can be returned by the APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Transport level failure: connect, read or write on the socket.
    NetworkError(String),
    /// Malformed frame or unexpected frame sequence.
    ProtocolViolation(String),
    /// Connection handshake failed, e.g. protocol version mismatch.
    HandshakeError(String),
    /// Credentials rejected by the server.
    AuthError(String),
    /// No reply within the configured timeout. The channel stays usable.
    TimeoutError(String),
    /// The channel was closed, locally or by the server.
    ChannelClosedError(String),
    /// The connection was closed, locally, by the server or by the library.
    ConnectionClosedError(String),
    /// Every candidate endpoint failed.
    BrokerUnreachableError(String),
    /// No free channel id up to the negotiated `channel_max`.
    ChannelLimitExceeded(u16),
    /// Connection is being recovered; the call was not attempted.
    NotConnected,
    /// Error when using the channel. Usually due to incorrect usage by user.
    ChannelUseError(String),
    /// Error in sending or receiving messages via internal communication channel.
    InternalChannelError(String),
}

impl Error {
    /// Errors that may go away by trying another endpoint or trying later.
    pub fn is_network_related(&self) -> bool {
        matches!(
            self,
            Error::NetworkError(_) | Error::TimeoutError(_) | Error::BrokerUnreachableError(_)
        )
    }
}

impl From<net::Error> for Error {
    fn from(err: net::Error) -> Self {
        match err {
            net::Error::FramingError(err) => Self::ProtocolViolation(err.to_string()),
            net::Error::InternalChannelError(msg) => Self::InternalChannelError(msg),
            other => Self::NetworkError(other.to_string()),
        }
    }
}
/// A value the application passed does not fit its AMQP type.
impl From<frame::Error> for Error {
    fn from(err: frame::Error) -> Self {
        match err {
            frame::Error::StringTooLong(..) => Self::ChannelUseError(err.to_string()),
            other => Self::ProtocolViolation(other.to_string()),
        }
    }
}
impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        Self::InternalChannelError(err.to_string())
    }
}
impl From<RecvError> for Error {
    fn from(err: RecvError) -> Self {
        Self::InternalChannelError(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NetworkError(msg) => write!(f, "AMQP network error: {}", msg),
            Error::ProtocolViolation(msg) => write!(f, "AMQP protocol violation: {}", msg),
            Error::HandshakeError(msg) => write!(f, "AMQP handshake error: {}", msg),
            Error::AuthError(msg) => write!(f, "AMQP authentication error: {}", msg),
            Error::TimeoutError(msg) => write!(f, "AMQP timeout: {}", msg),
            Error::ChannelClosedError(msg) => write!(f, "AMQP channel closed: {}", msg),
            Error::ConnectionClosedError(msg) => write!(f, "AMQP connection closed: {}", msg),
            Error::BrokerUnreachableError(msg) => write!(f, "AMQP broker unreachable: {}", msg),
            Error::ChannelLimitExceeded(max) => {
                write!(f, "AMQP channel limit exceeded, channel_max: {}", max)
            }
            Error::NotConnected => f.write_str("AMQP connection is recovering, not connected"),
            Error::ChannelUseError(msg) => write!(f, "AMQP channel usage error: {}", msg),
            Error::InternalChannelError(msg) => {
                write!(f, "internal communication error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}
