use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time,
};

use super::Error;
use crate::frame::{AmqpChannelId, Frame, PROTOCOL_HEADER};

const DEFAULT_BUFFER_SIZE: usize = 8192;

pub(crate) struct SplitConnection {
    reader: BufferReader,
    writer: BufferWriter,
}
pub(crate) struct BufferReader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
    /// zero until tuning is negotiated
    frame_max: usize,
}
pub(crate) struct BufferWriter {
    stream: OwnedWriteHalf,
    buffer: BytesMut,
}

impl SplitConnection {
    /// open a splitable socket connection
    pub async fn open(addr: &str, connect_timeout: Duration) -> Result<Self, Error> {
        let stream = time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::NetworkIoError(format!("timed out connecting to {}", addr))
            })??;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: BufferReader {
                stream: reader,
                buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
                frame_max: 0,
            },
            writer: BufferWriter {
                stream: writer,
                buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            },
        })
    }

    pub fn into_split(self) -> (BufferReader, BufferWriter) {
        (self.reader, self.writer)
    }

    /// forward to writer
    pub async fn write_protocol_header(&mut self) -> Result<(), Error> {
        self.writer.write_protocol_header().await
    }
    /// forward to writer
    pub async fn write_frame(&mut self, channel: AmqpChannelId, frame: Frame) -> Result<(), Error> {
        self.writer.write_frame(channel, &frame).await
    }
    /// forward to reader
    pub async fn read_frame(&mut self) -> Result<(AmqpChannelId, Frame), Error> {
        self.reader.read_frame().await
    }
    /// forward to reader
    pub fn set_frame_max(&mut self, frame_max: usize) {
        self.reader.frame_max = frame_max;
    }
}

impl BufferWriter {
    pub async fn write_protocol_header(&mut self) -> Result<(), Error> {
        self.stream.write_all(&PROTOCOL_HEADER).await?;
        Ok(())
    }

    /// write a frame over specific channel
    pub async fn write_frame(&mut self, channel: AmqpChannelId, frame: &Frame) -> Result<(), Error> {
        frame.encode(channel, &mut self.buffer)?;
        self.flush().await
    }

    /// write a sequence of frames without any other frame in between
    pub async fn write_frames(
        &mut self,
        channel: AmqpChannelId,
        frames: &[Frame],
    ) -> Result<(), Error> {
        let start = self.buffer.len();
        for frame in frames {
            if let Err(err) = frame.encode(channel, &mut self.buffer) {
                // never send part of a batch
                self.buffer.truncate(start);
                return Err(err.into());
            }
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), Error> {
        self.stream.write_all(&self.buffer).await?;
        // discard sent data in write buffer
        let len = self.buffer.len();
        self.buffer.advance(len);
        Ok(())
    }

    /// close the write half of the socket
    pub async fn close(mut self) -> Result<(), Error> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl BufferReader {
    /// Channels are multiplexed on one connection, so the channel id is
    /// returned along with the frame.
    pub async fn read_frame(&mut self) -> Result<(AmqpChannelId, Frame), Error> {
        loop {
            if let Some((len, channel, frame)) = Frame::decode(&self.buffer, self.frame_max)? {
                // discard parsed data in read buffer
                self.buffer.advance(len);
                return Ok((channel, frame));
            }
            let len = self.stream.read_buf(&mut self.buffer).await?;
            if len == 0 {
                if self.buffer.is_empty() {
                    return Err(Error::PeerShutdown);
                } else {
                    return Err(Error::NetworkIoError(
                        "connection reset in the middle of a frame".to_owned(),
                    ));
                }
            }
        }
    }
}
