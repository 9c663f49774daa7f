use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// frame-end octet missing or an unknown frame type
    Corrupted,
    /// payload larger than the negotiated frame_max
    TooLarge(usize, usize),
    UnknownMethod(u16, u16),
    /// string of the given length exceeds the limit of its AMQP type
    StringTooLong(usize, usize),
    SerdeError(String),
    /// peer answered with its own protocol header (major, minor, revision)
    ProtocolMismatch(u8, u8, u8),
}

impl From<amqp_serde::Error> for Error {
    fn from(err: amqp_serde::Error) -> Self {
        Self::SerdeError(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Corrupted => f.write_str("corrupted frame"),
            Error::TooLarge(size, max) => {
                write!(f, "frame of {} bytes exceeds frame_max {}", size, max)
            }
            Error::UnknownMethod(class_id, method_id) => {
                write!(f, "unknown method {}.{}", class_id, method_id)
            }
            Error::StringTooLong(len, max) => {
                write!(f, "string of {} bytes exceeds the limit of {}", len, max)
            }
            Error::SerdeError(msg) => write!(f, "serde error: {}", msg),
            Error::ProtocolMismatch(major, minor, revision) => write!(
                f,
                "server does not support AMQP 0-9-1, it proposed {}-{}-{}",
                major, minor, revision
            ),
        }
    }
}

impl std::error::Error for Error {}
