use super::Error;

/// `AMQP` followed by protocol id 0 and version 0-9-1.
pub const PROTOCOL_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 0, 0, 9, 1];

/// If the server rejects our protocol version it writes back its own header
/// and closes the socket. Returns the version it proposed.
pub(crate) fn check_protocol_mismatch(buf: &[u8]) -> Result<(), Error> {
    if buf.len() >= PROTOCOL_HEADER.len() && buf.starts_with(b"AMQP") {
        return Err(Error::ProtocolMismatch(buf[5], buf[6], buf[7]));
    }
    Ok(())
}
