use std::{fmt, io};

use crate::frame;
use tokio::sync::mpsc::error::SendError;

#[derive(Debug)]
pub(crate) enum Error {
    NetworkIoError(String),
    InternalChannelError(String),
    FramingError(frame::Error),
    PeerShutdown,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::NetworkIoError(err.to_string())
    }
}
impl From<frame::Error> for Error {
    fn from(err: frame::Error) -> Self {
        Error::FramingError(err)
    }
}
impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        Error::InternalChannelError(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NetworkIoError(msg) | Error::InternalChannelError(msg) => write!(f, "{}", msg),
            Error::FramingError(err) => write!(f, "{}", err),
            Error::PeerShutdown => f.write_str("peer shutdown"),
        }
    }
}

impl std::error::Error for Error {}
