//! Stream plumbing shared by the client and remote sides
//!
//! - [`ConnectionReader`]: read half plus the bytes read past the last consumed frame
//! - [`PrefixedStream`]: full-duplex stream that replays already-read bytes first
//! - [`NextReader`]: hand-back of a connection reader once a body has been consumed
//! - [`splice`]: bidirectional copy for tunnels and upgraded connections

use bytes::{Buf, BytesMut};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::oneshot;
use tracing::debug;

/// Bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Bytes requested from the socket per read when buffering
const READ_CHUNK: usize = 8 * 1024;

/// Split a boxed stream into independently owned halves
pub fn split_stream(stream: BoxedStream) -> (BoxedReader, BoxedWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Read side of a connection with its leftover buffer
///
/// Bytes beyond the current header or body frame stay in the buffer and are
/// served first by the next reader.
pub struct ConnectionReader {
    inner: BoxedReader,
    buffer: BytesMut,
}

impl ConnectionReader {
    pub fn new(inner: BoxedReader) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }

    /// Reader that first serves `buffer`
    pub fn with_buffer(inner: BoxedReader, buffer: BytesMut) -> Self {
        Self { inner, buffer }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Read more bytes from the socket into the buffer. Returns 0 on EOF.
    pub fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        self.buffer.reserve(READ_CHUNK);
        tokio_util::io::poll_read_buf(Pin::new(&mut self.inner), cx, &mut self.buffer)
    }

    pub async fn fill(&mut self) -> io::Result<usize> {
        poll_fn(|cx| self.poll_fill(cx)).await
    }

    /// Whether an idle connection can no longer carry a request: the remote
    /// closed it, failed it, or sent bytes nobody asked for.
    pub fn is_stale(&mut self) -> bool {
        if !self.buffer.is_empty() {
            return true;
        }
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        match self.poll_fill(&mut cx) {
            Poll::Pending => false,
            Poll::Ready(_) => true,
        }
    }

    pub fn into_parts(self) -> (BoxedReader, BytesMut) {
        (self.inner, self.buffer)
    }
}

impl AsyncRead for ConnectionReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffer.is_empty() {
            let n = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer[..n]);
            this.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Stream that serves a prefix before delegating to the wrapped stream
pub struct PrefixedStream<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: BytesMut, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Where the next read on a connection comes from
pub enum NextReader {
    /// Reader available immediately
    Ready(ConnectionReader),
    /// Reader returned once the current body reaches its end
    Pending(oneshot::Receiver<ConnectionReader>),
    /// Connection cannot carry another message
    Closed,
}

impl NextReader {
    /// Wait for the reader. `None` when the body was abandoned or the stream is unusable.
    pub async fn reclaim(self) -> Option<ConnectionReader> {
        match self {
            Self::Ready(reader) => Some(reader),
            Self::Pending(rx) => rx.await.ok(),
            Self::Closed => None,
        }
    }
}

/// Raw remote streams handed over after a tunnel connect or protocol upgrade
pub struct UpgradedLink {
    pub reader: ConnectionReader,
    pub writer: BoxedWriter,
}

/// Byte counts of a finished splice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceOutcome {
    /// Client to remote
    pub sent: u64,
    /// Remote to client
    pub received: u64,
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64, buffer_size: usize)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() || writer.flush().await.is_err() {
            break;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    let _ = writer.shutdown().await;
}

/// Copy in both directions until either direction finishes or fails
pub async fn splice(
    mut client_reader: ConnectionReader,
    mut client_writer: BoxedWriter,
    mut remote_reader: ConnectionReader,
    mut remote_writer: BoxedWriter,
    buffer_size: usize,
) -> SpliceOutcome {
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    tokio::select! {
        _ = pump(&mut client_reader, &mut remote_writer, &sent, buffer_size) => {
            debug!("Splice ended on the client side");
        }
        _ = pump(&mut remote_reader, &mut client_writer, &received, buffer_size) => {
            debug!("Splice ended on the remote side");
        }
    }

    let _ = client_writer.shutdown().await;
    let _ = remote_writer.shutdown().await;

    SpliceOutcome {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
    }
}
