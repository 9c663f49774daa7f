use self::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// macro should appear before module declaration
#[macro_use]
mod helpers {
    /// Unwraps the method of a reply, anything else is a protocol violation.
    macro_rules! get_expected_method {
        ($method:expr, $variant:path) => {
            match $method {
                $variant(method) => Ok(method),
                other => Err($crate::api::error::Error::ProtocolViolation(format!(
                    "unexpected reply {}",
                    other.id()
                ))),
            }
        };
    }
}

/////////////////////////////////////////////////////////////////////////////
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod events;
pub mod security;
