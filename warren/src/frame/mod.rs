//! AMQP 0-9-1 frame codec.
//!
//! A frame is `type (1) | channel (2) | size (4) | payload | 0xCE`. Method
//! payloads start with their `(class-id, method-id)` pair, content is carried
//! by a content header frame followed by zero or more body frames.

use amqp_serde::{from_bytes, to_bytes};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

mod constants;
mod content_header;
mod error;
mod method;
mod protocol_header;
mod types;

pub use constants::*;
pub use content_header::*;
pub use error::*;
pub use method::*;
pub use protocol_header::*;
pub use types::*;

//////////////////////////////////////////////////////////////////////////

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct FrameHeader {
    pub frame_type: Octect, // 1: method, 2: content-header, 3: content-body, 8: heartbeat
    pub channel: ShortUint,
    pub payload_size: LongUint,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Method(Method),
    ContentHeader(ContentHeader),
    ContentBody(Bytes),
    Heartbeat,
}

impl Frame {
    pub fn frame_type(&self) -> Octect {
        match self {
            Frame::Method(_) => FRAME_METHOD,
            Frame::ContentHeader(_) => FRAME_CONTENT_HEADER,
            Frame::ContentBody(_) => FRAME_CONTENT_BODY,
            Frame::Heartbeat => FRAME_HEARTBEAT,
        }
    }

    /// Append the complete frame, header and frame-end included, to `buf`.
    /// Nothing is appended if the payload cannot be serialized.
    pub fn encode(&self, channel: AmqpChannelId, buf: &mut BytesMut) -> Result<(), Error> {
        let payload = match self {
            Frame::Method(method) => method.encode()?,
            Frame::ContentHeader(header) => to_bytes(header)?,
            Frame::ContentBody(_) | Frame::Heartbeat => Vec::new(),
        };
        let body: &[u8] = match self {
            Frame::ContentBody(body) => body,
            _ => &payload,
        };
        let header = FrameHeader {
            frame_type: self.frame_type(),
            channel,
            payload_size: body.len() as LongUint,
        };
        buf.put_slice(&to_bytes(&header)?);
        buf.put_slice(body);
        buf.put_u8(FRAME_END);
        Ok(())
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more bytes are needed, otherwise the number of
    /// bytes consumed together with the channel and the frame. `frame_max` of
    /// zero means no limit.
    pub fn decode(
        buf: &[u8],
        frame_max: usize,
    ) -> Result<Option<(usize, AmqpChannelId, Frame)>, Error> {
        let raw_header = match buf.get(..FRAME_HEADER_SIZE) {
            Some(raw) => raw,
            None => return Ok(None),
        };
        check_protocol_mismatch(buf)?;
        let FrameHeader {
            frame_type,
            channel,
            payload_size,
        } = from_bytes(raw_header)?;

        let total = payload_size as usize + FRAME_OVERHEAD;
        if frame_max != 0 && total > frame_max {
            return Err(Error::TooLarge(total, frame_max));
        }
        if buf.len() < total {
            return Ok(None);
        }
        if buf[total - 1] != FRAME_END {
            return Err(Error::Corrupted);
        }

        let payload = &buf[FRAME_HEADER_SIZE..total - 1];
        let frame = match frame_type {
            FRAME_METHOD => Frame::Method(Method::decode(payload)?),
            FRAME_CONTENT_HEADER => Frame::ContentHeader(from_bytes(payload)?),
            FRAME_CONTENT_BODY => Frame::ContentBody(Bytes::copy_from_slice(payload)),
            FRAME_HEARTBEAT => Frame::Heartbeat,
            _ => return Err(Error::Corrupted),
        };
        Ok(Some((total, channel, frame)))
    }
}

impl From<Method> for Frame {
    fn from(method: Method) -> Self {
        Frame::Method(method)
    }
}
