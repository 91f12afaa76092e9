//! `Content-Length` framing over a duplex byte stream.
//!
//! LSP prefixes every message with a header block:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//! Header names are matched case-insensitively and headers other than
//! `Content-Length` (such as `Content-Type`) are ignored. Outbound frames are
//! queued and written by a single writer task, so frames from concurrent
//! callers never interleave.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::errors::FramingError;

pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// Maximum size of a header block, terminator excluded.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Default limit on a declared `Content-Length`.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Splits a byte stream into frame payloads and frames outbound payloads.
#[derive(Debug)]
pub struct FrameCodec {
    content_length: Option<usize>,
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Creates a codec positioned at a frame boundary that accepts frames
    /// up to [`MAX_FRAME_BYTES`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    /// Creates a codec rejecting declared lengths above `limit`.
    #[must_use]
    pub const fn with_max_frame_bytes(limit: usize) -> Self {
        Self {
            content_length: None,
            max_frame_bytes: limit,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = if let Some(length) = self.content_length {
            length
        } else {
            let Some(end) = find_header_end(src) else {
                if src.len() > MAX_HEADER_BYTES + HEADER_TERMINATOR.len() {
                    return Err(FramingError::HeaderTooLong {
                        limit: MAX_HEADER_BYTES,
                    });
                }
                return Ok(None);
            };
            let (header, _) = src.split_at(end);
            let declared = parse_headers(header)?;
            if declared > self.max_frame_bytes {
                return Err(FramingError::FrameTooLarge {
                    length: declared,
                    limit: self.max_frame_bytes,
                });
            }
            src.advance(end + HEADER_TERMINATOR.len());
            self.content_length = Some(declared);
            declared
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.content_length = None;
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() && self.content_length.is_none() {
            return Ok(None);
        }
        Err(FramingError::TruncatedFrame {
            buffered: src.len(),
        })
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = format!("Content-Length: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&item);
        Ok(())
    }
}

/// Returns the offset of the header terminator within the lookahead window.
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    let window = buffer.len().min(MAX_HEADER_BYTES + HEADER_TERMINATOR.len());
    let (lookahead, _) = buffer.split_at(window);
    lookahead
        .windows(HEADER_TERMINATOR.len())
        .position(|candidate| candidate == HEADER_TERMINATOR)
}

fn parse_headers(block: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(block).map_err(|_| FramingError::NonUtf8Header)?;
    let mut content_length = None;

    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(FramingError::MalformedHeader {
                line: line.to_owned(),
            });
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let digits = value.trim();
            let parsed = digits
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidContentLength {
                    value: digits.to_owned(),
                })?;
            content_length = Some(parsed);
        }
    }

    content_length.ok_or(FramingError::MissingContentLength)
}

/// Wraps a reader in a stream of frame payloads.
///
/// The stream ends cleanly when the reader reaches end of file between
/// frames and yields [`FramingError::TruncatedFrame`] when it ends inside one.
pub fn read_frames<R: AsyncRead>(reader: R) -> FramedRead<R, FrameCodec> {
    FramedRead::new(reader, FrameCodec::new())
}

/// Cloneable handle that queues payloads for the writer task.
#[derive(Debug, Clone)]
pub struct FrameSender {
    queue: mpsc::UnboundedSender<Bytes>,
}

impl FrameSender {
    /// Queues one payload to be framed and written.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::BrokenPipe`] once the writer task has
    /// stopped.
    pub fn write(&self, payload: impl Into<Bytes>) -> io::Result<()> {
        self.queue.send(payload.into()).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "transport writer has stopped")
        })
    }

    /// Returns whether the writer task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Spawns the task that owns `writer` and drains the frame queue into it.
///
/// The task stops on the first write error or once every [`FrameSender`]
/// has been dropped, closing the writer on the way out.
pub fn spawn_writer<W>(writer: W) -> (FrameSender, JoinHandle<()>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (queue, mut frames) = mpsc::unbounded_channel::<Bytes>();
    let task = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, FrameCodec::new());
        while let Some(frame) = frames.recv().await {
            let length = frame.len();
            if let Err(error) = sink.send(frame).await {
                warn!(
                    target: TRANSPORT_TARGET,
                    error = %error,
                    "failed to write frame"
                );
                break;
            }
            debug!(target: TRANSPORT_TARGET, length, "frame written");
        }
        if let Err(error) = sink.close().await {
            debug!(
                target: TRANSPORT_TARGET,
                error = %error,
                "failed to close transport writer"
            );
        }
    });
    (FrameSender { queue }, task)
}

/// Both halves of a framed connection.
pub struct Transport<R> {
    frames: FramedRead<R, FrameCodec>,
    sender: FrameSender,
    writer: JoinHandle<()>,
}

impl<R: AsyncRead + Unpin> Transport<R> {
    /// Frames `reader` and spawns the writer task for `writer`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<W>(reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, writer) = spawn_writer(writer);
        Self {
            frames: read_frames(reader),
            sender,
            writer,
        }
    }

    /// Reads the next frame payload; `None` at a clean end of stream.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes, FramingError>> {
        self.frames.next().await
    }

    /// Queues one payload for writing.
    ///
    /// # Errors
    ///
    /// Returns an error once the writer task has stopped.
    pub fn write(&self, payload: impl Into<Bytes>) -> io::Result<()> {
        self.sender.write(payload)
    }

    /// Returns a handle for queueing frames from other tasks.
    #[must_use]
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Splits the transport into its inbound stream, sender and writer task.
    pub fn into_parts(self) -> (FramedRead<R, FrameCodec>, FrameSender, JoinHandle<()>) {
        (self.frames, self.sender, self.writer)
    }
}
