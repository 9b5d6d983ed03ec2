//! Message bodies
//!
//! Bodies are plain `AsyncRead` streams. Framing is applied by wrappers that
//! own the connection reader and never read past the end of their frame:
//! - [`ContentLengthReader`]: exactly N bytes
//! - [`ChunkedReader`]: chunked transfer coding, decoded
//! - [`Reclaim`]: hands the connection reader back once the frame is exhausted
//! - [`MetricsStream`]: first byte / end / error notifications

use bytes::Buf;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::oneshot;

use crate::stream::{BoxedReader, ConnectionReader, NextReader};

/// Longest chunk-size or trailer line accepted
const MAX_CHUNK_LINE: usize = 4096;

/// A message body. Never absent: a message without payload carries [`Body::empty`].
pub struct Body {
    inner: BoxedReader,
    empty: bool,
}

impl Body {
    pub fn empty() -> Self {
        Self {
            inner: Box::new(tokio::io::empty()),
            empty: true,
        }
    }

    pub fn new(reader: impl AsyncRead + Send + Sync + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(reader),
            empty: false,
        }
    }

    pub fn from_bytes(data: impl Into<bytes::Bytes>) -> Self {
        let data: bytes::Bytes = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        Self::new(io::Cursor::new(data))
    }

    /// True for the empty sentinel
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Read the remaining body into memory
    pub async fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.inner.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Consume and discard the remaining body
    pub async fn drain(&mut self) -> io::Result<u64> {
        tokio::io::copy(&mut self.inner, &mut tokio::io::sink()).await
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").field("empty", &self.empty).finish()
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// Framed reader that can give its connection back when done
pub trait FramedSource: AsyncRead + Send + Sync + Unpin {
    fn is_finished(&self) -> bool;
    fn into_reader(self) -> ConnectionReader;
}

fn unexpected_eof(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("stream closed inside {}", what),
    )
}

/// Serves exactly `length` bytes
pub struct ContentLengthReader {
    reader: ConnectionReader,
    remaining: u64,
}

impl ContentLengthReader {
    pub fn new(reader: ConnectionReader, length: u64) -> Self {
        Self {
            reader,
            remaining: length,
        }
    }
}

impl AsyncRead for ContentLengthReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.remaining == 0 || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            let buffered = this.reader.buffered();
            if !buffered.is_empty() {
                let n = (buffered.len() as u64)
                    .min(this.remaining)
                    .min(buf.remaining() as u64) as usize;
                buf.put_slice(&buffered[..n]);
                this.reader.buffer_mut().advance(n);
                this.remaining -= n as u64;
                return Poll::Ready(Ok(()));
            }
            if ready!(this.reader.poll_fill(cx))? == 0 {
                return Poll::Ready(Err(unexpected_eof("a content-length body")));
            }
        }
    }
}

impl FramedSource for ContentLengthReader {
    fn is_finished(&self) -> bool {
        self.remaining == 0
    }

    fn into_reader(self) -> ConnectionReader {
        self.reader
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Decodes the chunked transfer coding
pub struct ChunkedReader {
    reader: ConnectionReader,
    state: ChunkState,
}

impl ChunkedReader {
    pub fn new(reader: ConnectionReader) -> Self {
        Self {
            reader,
            state: ChunkState::Size,
        }
    }

    /// Take one CRLF terminated line from the buffer
    fn take_line(&mut self) -> io::Result<Option<String>> {
        let buffered = self.reader.buffered();
        match buffered.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let line = String::from_utf8_lossy(&buffered[..pos]).into_owned();
                self.reader.buffer_mut().advance(pos + 2);
                Ok(Some(line))
            }
            None if buffered.len() > MAX_CHUNK_LINE => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk line too long",
            )),
            None => Ok(None),
        }
    }
}

fn parse_chunk_size(line: &str) -> io::Result<u64> {
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid chunk size `{}`", line),
        )
    })
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                ChunkState::Done => return Poll::Ready(Ok(())),
                ChunkState::Size => match this.take_line()? {
                    Some(line) => {
                        let size = parse_chunk_size(&line)?;
                        this.state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data(size)
                        };
                        continue;
                    }
                    None => {}
                },
                ChunkState::Data(remaining) => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let buffered = this.reader.buffered();
                    if !buffered.is_empty() {
                        let n = (buffered.len() as u64)
                            .min(remaining)
                            .min(buf.remaining() as u64) as usize;
                        buf.put_slice(&buffered[..n]);
                        this.reader.buffer_mut().advance(n);
                        let left = remaining - n as u64;
                        this.state = if left == 0 {
                            ChunkState::DataEnd
                        } else {
                            ChunkState::Data(left)
                        };
                        return Poll::Ready(Ok(()));
                    }
                }
                ChunkState::DataEnd => {
                    if this.reader.buffered().len() >= 2 {
                        if &this.reader.buffered()[..2] != b"\r\n" {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "missing CRLF after chunk data",
                            )));
                        }
                        this.reader.buffer_mut().advance(2);
                        this.state = ChunkState::Size;
                        continue;
                    }
                }
                ChunkState::Trailer => match this.take_line()? {
                    Some(line) if line.is_empty() => {
                        this.state = ChunkState::Done;
                        continue;
                    }
                    Some(_) => continue,
                    None => {}
                },
            }

            if ready!(this.reader.poll_fill(cx))? == 0 {
                return Poll::Ready(Err(unexpected_eof("a chunked body")));
            }
        }
    }
}

impl FramedSource for ChunkedReader {
    fn is_finished(&self) -> bool {
        self.state == ChunkState::Done
    }

    fn into_reader(self) -> ConnectionReader {
        self.reader
    }
}

/// Sends the connection reader through a oneshot once the framed body ends
pub struct Reclaim<T> {
    inner: Option<T>,
    sender: Option<oneshot::Sender<ConnectionReader>>,
}

impl<T: FramedSource> Reclaim<T> {
    pub fn new(source: T) -> (Self, oneshot::Receiver<ConnectionReader>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Some(source),
                sender: Some(tx),
            },
            rx,
        )
    }

    fn release(&mut self) {
        if let (Some(inner), Some(tx)) = (self.inner.take(), self.sender.take()) {
            let _ = tx.send(inner.into_reader());
        }
    }
}

impl<T: FramedSource> AsyncRead for Reclaim<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let before = buf.filled().len();
        ready!(Pin::new(&mut *inner).poll_read(cx, buf))?;
        if buf.filled().len() == before && inner.is_finished() {
            this.release();
        }
        Poll::Ready(Ok(()))
    }
}

/// Wrap a framed source so the connection comes back through the returned [`NextReader`]
pub fn reclaimable<T: FramedSource + 'static>(source: T) -> (Body, NextReader) {
    if source.is_finished() {
        return (Body::empty(), NextReader::Ready(source.into_reader()));
    }
    let (reclaim, rx) = Reclaim::new(source);
    (Body::new(reclaim), NextReader::Pending(rx))
}

type FirstByteHook = Box<dyn FnOnce() + Send + Sync>;
type EndHook = Box<dyn FnOnce(u64) + Send + Sync>;
type ErrorHook = Box<dyn FnOnce(String) + Send + Sync>;

/// Body wrapper reporting first byte, end of stream and failure.
///
/// Dropping the stream before its end counts as a failure.
pub struct MetricsStream<R> {
    inner: R,
    total: u64,
    on_first_byte: Option<FirstByteHook>,
    on_end: Option<EndHook>,
    on_error: Option<ErrorHook>,
}

impl<R> MetricsStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            total: 0,
            on_first_byte: None,
            on_end: None,
            on_error: None,
        }
    }

    pub fn on_first_byte(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_first_byte = Some(Box::new(hook));
        self
    }

    pub fn on_end(mut self, hook: impl FnOnce(u64) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl FnOnce(String) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    fn finish(&mut self) {
        self.on_error = None;
        if let Some(hook) = self.on_end.take() {
            hook(self.total);
        }
    }

    fn fail(&mut self, reason: String) {
        self.on_end = None;
        if let Some(hook) = self.on_error.take() {
            hook(reason);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MetricsStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match ready!(Pin::new(&mut this.inner).poll_read(cx, buf)) {
            Ok(()) => {
                let n = (buf.filled().len() - before) as u64;
                if n > 0 {
                    if let Some(hook) = this.on_first_byte.take() {
                        hook();
                    }
                    this.total += n;
                } else if buf.remaining() > 0 {
                    this.finish();
                }
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                this.fail(e.to_string());
                Poll::Ready(Err(e))
            }
        }
    }
}

impl<R> Drop for MetricsStream<R> {
    fn drop(&mut self) {
        if self.on_end.is_some() {
            self.fail("body dropped before completion".to_string());
        }
    }
}

/// Error from [`copy_body`], split by direction
#[derive(Debug)]
pub enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

/// Copy a body to `writer`, re-applying chunked framing when `chunked` is set.
/// Returns the number of payload bytes copied.
pub async fn copy_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunked: bool,
    buffer_size: usize,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(CopyError::Read)?;
        if n == 0 {
            break;
        }
        if chunked {
            writer
                .write_all(format!("{:x}\r\n", n).as_bytes())
                .await
                .map_err(CopyError::Write)?;
            writer.write_all(&buf[..n]).await.map_err(CopyError::Write)?;
            writer.write_all(b"\r\n").await.map_err(CopyError::Write)?;
        } else {
            writer.write_all(&buf[..n]).await.map_err(CopyError::Write)?;
        }
        total += n as u64;
    }
    if chunked {
        writer.write_all(b"0\r\n\r\n").await.map_err(CopyError::Write)?;
    }
    writer.flush().await.map_err(CopyError::Write)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::io::duplex;

    fn reader_over(data: &'static [u8]) -> ConnectionReader {
        ConnectionReader::with_buffer(
            Box::new(tokio::io::empty()),
            BytesMut::from(data),
        )
    }

    #[tokio::test]
    async fn test_content_length_with_split_reads() {
        let (mut tx, rx) = duplex(4);
        let writer = tokio::spawn(async move {
            for part in [&b"he"[..], b"llo w", b"orld", b"NEXT"] {
                tx.write_all(part).await.unwrap();
            }
        });

        let reader = ConnectionReader::new(Box::new(rx));
        let (mut body, next) = reclaimable(ContentLengthReader::new(reader, 11));
        let data = body.read_to_vec().await.unwrap();
        assert_eq!(data, b"hello world");

        let mut reader = next.reclaim().await.unwrap();
        writer.await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn test_content_length_premature_eof() {
        let (mut body, _next) = reclaimable(ContentLengthReader::new(reader_over(b"abc"), 10));
        let err = body.read_to_vec().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_chunked_decode() {
        let (mut body, next) =
            reclaimable(ChunkedReader::new(reader_over(b"4\r\ntest\r\n0\r\n\r\n")));
        assert_eq!(body.read_to_vec().await.unwrap(), b"test");
        let reader = next.reclaim().await.unwrap();
        assert!(reader.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_chunked_with_extensions_and_trailers() {
        let data = b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: a\r\n\r\nGET";
        let (mut body, next) = reclaimable(ChunkedReader::new(reader_over(data)));
        assert_eq!(body.read_to_vec().await.unwrap(), b"hello world");
        let reader = next.reclaim().await.unwrap();
        assert_eq!(reader.buffered(), b"GET");
    }

    #[tokio::test]
    async fn test_chunked_byte_by_byte() {
        let (mut tx, rx) = duplex(1);
        tokio::spawn(async move {
            for b in b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n" {
                tx.write_all(&[*b]).await.unwrap();
            }
        });
        let (mut body, _next) = reclaimable(ChunkedReader::new(ConnectionReader::new(Box::new(rx))));
        assert_eq!(body.read_to_vec().await.unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn test_chunked_invalid_size() {
        let (mut body, _next) = reclaimable(ChunkedReader::new(reader_over(b"zz\r\n")));
        let err = body.read_to_vec().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_zero_length_is_ready() {
        let (body, next) = reclaimable(ContentLengthReader::new(reader_over(b"rest"), 0));
        assert!(body.is_empty());
        assert!(matches!(next, NextReader::Ready(_)));
    }

    #[tokio::test]
    async fn test_metrics_stream_hooks() {
        let first = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicU64::new(0));
        let (f, t) = (first.clone(), total.clone());

        let mut stream = MetricsStream::new(io::Cursor::new(b"payload".to_vec()))
            .on_first_byte(move || f.store(true, Ordering::SeqCst))
            .on_end(move |n| t.store(n, Ordering::SeqCst))
            .on_error(|_| panic!("no error expected"));

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(first.load(Ordering::SeqCst));
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_metrics_stream_drop_reports_error() {
        let failed = Arc::new(AtomicBool::new(false));
        let f = failed.clone();
        let stream = MetricsStream::new(io::Cursor::new(b"x".to_vec()))
            .on_end(|_| {})
            .on_error(move |_| f.store(true, Ordering::SeqCst));
        drop(stream);
        assert!(failed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_copy_body_rechunks() {
        let mut source = io::Cursor::new(b"abcdef".to_vec());
        let mut out = Vec::new();
        let n = copy_body(&mut source, &mut out, true, 4).await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(out, b"4\r\nabcd\r\n2\r\nef\r\n0\r\n\r\n");
    }
}
