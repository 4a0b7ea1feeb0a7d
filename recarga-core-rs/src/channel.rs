//! Self-delimiting JSON message channel over a byte stream
//!
//! Each message is one compact JSON object followed by `\n`. The reader does
//! not rely on the newline: it consumes exactly one JSON value per call, so
//! values glued together or split across reads decode the same way.

use crate::error::ChannelError;
use crate::types::Message;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// Maximum buffered size of a single message
pub const MAX_MSG_SIZE: usize = 65536;

const READ_CHUNK: usize = 4096;

/// Reading half of a channel
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            eof: false,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on a clean end of stream.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ChannelError> {
        loop {
            if let Some(msg) = self.try_decode()? {
                trace!("Channel: decoded {}", msg.kind);
                return Ok(Some(msg));
            }

            if self.eof {
                return if self.buf.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    Err(ChannelError::Truncated(self.buf.len()))
                };
            }

            if self.buf.len() > MAX_MSG_SIZE {
                return Err(ChannelError::Oversized(MAX_MSG_SIZE));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    /// Decode one value from the front of the buffer if it is complete
    fn try_decode(&mut self) -> Result<Option<Message>, ChannelError> {
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return Ok(None);
        };

        let (result, offset) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf[start..]).into_iter::<Message>();
            let result = stream.next();
            (result, stream.byte_offset())
        };

        match result {
            Some(Ok(msg)) => {
                self.buf.drain(..start + offset);
                Ok(Some(msg))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(ChannelError::Decode(e)),
            None => Ok(None),
        }
    }
}

/// Writing half of a channel
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and flush one message
    pub async fn send(&mut self, msg: &Message) -> Result<(), ChannelError> {
        let mut bytes = msg.to_bytes()?;
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Destination for outgoing messages
pub trait MessageSink: Send + Sync {
    fn send(&self, msg: Message) -> BoxFuture<'_, Result<(), ChannelError>>;
}

/// Writer shared between concurrent tasks.
///
/// Sends are serialized by an async mutex so two messages never interleave on
/// the wire. Once closed, every send fails with [`ChannelError::Closed`].
pub struct SharedWriter<W> {
    writer: Mutex<MessageWriter<W>>,
    closed: AtomicBool,
}

impl<W: AsyncWrite + Unpin + Send> SharedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: Mutex::new(MessageWriter::new(inner)),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn send_message(&self, msg: &Message) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(msg).await
    }

    /// Shut the stream down. Returns false if it was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Channel: shutdown failed: {}", e);
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<W: AsyncWrite + Unpin + Send> MessageSink for SharedWriter<W> {
    fn send(&self, msg: Message) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move { self.send_message(&msg).await })
    }
}

impl<T: MessageSink + ?Sized> MessageSink for Arc<T> {
    fn send(&self, msg: Message) -> BoxFuture<'_, Result<(), ChannelError>> {
        (**self).send(msg)
    }
}

impl MessageSink for mpsc::UnboundedSender<Message> {
    fn send(&self, msg: Message) -> BoxFuture<'_, Result<(), ChannelError>> {
        let result = mpsc::UnboundedSender::send(self, msg).map_err(|_| ChannelError::Closed);
        Box::pin(async move { result })
    }
}

/// Split a TCP stream into a reader and a shareable writer
pub fn split_stream(stream: TcpStream) -> (MessageReader<OwnedReadHalf>, SharedWriter<OwnedWriteHalf>) {
    let (read_half, write_half) = stream.into_split();
    (MessageReader::new(read_half), SharedWriter::new(write_half))
}
