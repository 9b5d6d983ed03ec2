//! Header block detection
//!
//! Reads from a stream until the blank line ending a header block. Bytes
//! received after the blank line are kept in the caller's buffer for the body
//! or the next message.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ErrorSide, ExchangeError, ProxyError};
use crate::stream::ConnectionReader;

const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Position just past the first double CRLF, scanning from `from`
pub fn find_header_end(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < CRLF_CRLF.len() {
        return None;
    }
    let start = from.min(data.len());
    data[start..]
        .windows(CRLF_CRLF.len())
        .position(|w| w == CRLF_CRLF)
        .map(|pos| start + pos + CRLF_CRLF.len())
}

/// Read one header block from `stream`, buffering through `buffer`.
///
/// Returns `Ok(None)` when the stream closes before any byte of a new block,
/// unless `throw_on_empty` is set, in which case it is an error.
pub async fn read_header_block<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    max_header_length: usize,
    side: ErrorSide,
    throw_on_empty: bool,
) -> Result<Option<Bytes>, ProxyError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut scanned: usize = 0;
    loop {
        if let Some(end) = find_header_end(buffer, scanned.saturating_sub(CRLF_CRLF.len() - 1)) {
            if end > max_header_length {
                return Err(ExchangeError::HeaderTooLarge {
                    side,
                    limit: max_header_length,
                }
                .into());
            }
            return Ok(Some(buffer.split_to(end).freeze()));
        }
        scanned = buffer.len();

        if buffer.len() >= max_header_length {
            return Err(ExchangeError::HeaderTooLarge {
                side,
                limit: max_header_length,
            }
            .into());
        }

        buffer.reserve(max_header_length - buffer.len());
        let read = stream.read_buf(buffer).await.map_err(|e| match side {
            ErrorSide::Client => ProxyError::Downstream(e),
            ErrorSide::Remote => ProxyError::Io(e),
        })?;

        if read == 0 {
            if buffer.is_empty() {
                if throw_on_empty {
                    return Err(match side {
                        ErrorSide::Remote => ProxyError::ConnectionClosed,
                        ErrorSide::Client => ExchangeError::TruncatedHeader { side }.into(),
                    });
                }
                return Ok(None);
            }
            return Err(ExchangeError::TruncatedHeader { side }.into());
        }
    }
}

/// [`read_header_block`] over a [`ConnectionReader`] and its leftover buffer
pub async fn read_header(
    reader: &mut ConnectionReader,
    max_header_length: usize,
    side: ErrorSide,
    throw_on_empty: bool,
) -> Result<Option<Bytes>, ProxyError> {
    let mut buffer = std::mem::take(reader.buffer_mut());
    let result = {
        let mut inner = Unbuffered(reader);
        read_header_block(&mut inner, &mut buffer, max_header_length, side, throw_on_empty).await
    };
    *reader.buffer_mut() = buffer;
    result
}

/// Raw socket access to a connection reader whose buffer has been moved out
struct Unbuffered<'a>(&'a mut ConnectionReader);

impl AsyncRead for Unbuffered<'_> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        // The buffer is empty while detached, so this reads straight from the socket.
        std::pin::Pin::new(&mut *self.get_mut().0).poll_read(cx, buf)
    }
}
