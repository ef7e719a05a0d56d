// TCP transport for SMPP v3.4 sessions: length-prefixed frame I/O with
// read-side buffering. PDUs may arrive coalesced or fragmented; the reader
// buffers across reads until a complete frame is available.

use crate::codec::{CodecError, Frame};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A connected SMPP transport, before it is split into the session's
/// dedicated reader and serialized writer.
///
/// The session concurrency contract is one read loop plus one serialized
/// write path; `into_split` yields the two halves.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Connection { stream }
    }

    pub async fn connect(host: &str, port: u16) -> io::Result<Connection> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Connection::new(stream))
    }

    /// Split into independently-owned reader and writer halves.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader {
                stream: read_half,
                buffer: BytesMut::with_capacity(4 * 1024),
            },
            FrameWriter {
                stream: BufWriter::new(write_half),
            },
        )
    }
}

/// Read half: frames PDUs out of the byte stream.
#[derive(Debug)]
pub struct FrameReader {
    stream: OwnedReadHalf,
    // Partial-frame bytes carried between reads
    buffer: BytesMut,
}

impl FrameReader {
    /// Read a single frame from the underlying stream.
    ///
    /// Waits until enough data has been buffered to parse a frame. Returns
    /// `None` on a clean end-of-stream (no partial frame left behind); a
    /// mid-frame EOF is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
        }
    }

    /// Try to parse one frame out of the buffer; `Ok(None)` means more bytes
    /// are needed. Invalid framing is fatal to the connection.
    fn parse_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(()) => {
                // check() verified a complete PDU is buffered; the declared
                // length tells us how much to discard afterwards
                let command_length = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;

                buf.set_position(0);
                let frame = Frame::parse(&mut buf)?;

                self.buffer.advance(command_length);

                Ok(Some(frame))
            }
            Err(CodecError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Write half: serializes frames onto the stream. The caller must ensure only
/// one task writes at a time (the session wraps this in a mutex).
#[derive(Debug)]
pub struct FrameWriter {
    stream: BufWriter<OwnedWriteHalf>,
}

impl FrameWriter {
    /// Write a single frame and flush it to the socket.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), CodecError> {
        let bytes = frame.to_bytes()?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write side, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
