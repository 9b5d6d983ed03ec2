//! HTTP/1.1 processing on one connection
//!
//! Forwarding side: write the request header and body, read the response header
//! (skipping interim 1xx responses), then frame the response body so the
//! connection reader comes back once the body has been consumed.
//!
//! Client side: write the (altered) response header and body back to the client.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ErrorSide, ProxyError};
use crate::exchange::{Exchange, HeaderAlteration, Response};
use crate::http::body::{
    copy_body, reclaimable, Body, ChunkedReader, ContentLengthReader, CopyError, MetricsStream,
};
use crate::http::detect::read_header;
use crate::http::header::ResponseHeader;
use crate::stream::{ConnectionReader, NextReader};

/// Limits applied while processing one exchange
#[derive(Debug, Clone, Copy)]
pub struct H11Options {
    pub max_header_length: usize,
    pub buffer_size: usize,
}

impl Default for H11Options {
    fn default() -> Self {
        Self {
            max_header_length: 16 * 1024,
            buffer_size: 16 * 1024,
        }
    }
}

/// Forward the request of `exchange` and attach the response.
///
/// The returned [`NextReader`] yields the connection reader once the response
/// body has been fully read.
pub async fn process<W>(
    exchange: &mut Exchange,
    mut reader: ConnectionReader,
    writer: &mut W,
    options: &H11Options,
) -> Result<NextReader, ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    send_request(exchange, writer, options, true).await?;
    let header = read_response_header(exchange, &mut reader, options).await?;
    Ok(frame_response(exchange, header, reader))
}

/// Write the request header then the request body
pub async fn send_request<W>(
    exchange: &mut Exchange,
    writer: &mut W,
    options: &H11Options,
    skip_non_forwardable: bool,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(1024);
    exchange.metrics.stamp(|m| &mut m.request_header_sending);
    let header_length = exchange.request.header.write_http11(
        &exchange.context.request_header_alterations,
        skip_non_forwardable,
        &mut buf,
    );
    writer.write_all(&buf).await?;
    writer.flush().await?;
    exchange.metrics.update(|m| {
        m.request_header_sent = Some(chrono::Utc::now());
        m.request_header_length = header_length;
        m.total_sent += header_length as u64;
    });

    let mut body = exchange.request.take_body();
    if !body.is_empty() {
        let chunked = exchange.request.header.is_chunked();
        let sent = copy_body(&mut body, writer, chunked, options.buffer_size)
            .await
            .map_err(|e| match e {
                CopyError::Read(e) => ProxyError::Downstream(e),
                CopyError::Write(e) => ProxyError::Io(e),
            })?;
        exchange.metrics.update(|m| m.total_sent += sent);
    }
    exchange.metrics.stamp(|m| &mut m.request_body_sent);
    Ok(())
}

/// Read the final response header; interim responses other than 101 are skipped
pub async fn read_response_header(
    exchange: &mut Exchange,
    reader: &mut ConnectionReader,
    options: &H11Options,
) -> Result<ResponseHeader, ProxyError> {
    exchange.metrics.stamp(|m| &mut m.response_header_start);
    loop {
        let block = read_header(reader, options.max_header_length, ErrorSide::Remote, true)
            .await?
            .ok_or(ProxyError::ConnectionClosed)?;
        let header = ResponseHeader::parse(&block)?;
        exchange.metrics.update(|m| m.total_received += block.len() as u64);

        let status = header.status_code();
        if (100..200).contains(&status) && status != 101 {
            debug!(exchange_id = exchange.id, status, "Skipping interim response");
            continue;
        }

        exchange.metrics.update(|m| {
            m.response_header_end = Some(chrono::Utc::now());
            m.response_header_length = block.len();
        });
        return Ok(header);
    }
}

/// Attach `header` and its framed body to the exchange.
///
/// The exchange completes when the body ends (or immediately when there is
/// none) with the close decision derived from the header.
pub fn frame_response(
    exchange: &mut Exchange,
    header: ResponseHeader,
    reader: ConnectionReader,
) -> NextReader {
    let method = exchange.request.header.method().to_string();
    let completion = exchange.completion();
    let should_close = header.connection_close_request() || header.is_chunked();

    if !header.has_response_body(&method) {
        exchange.metrics.update(|m| {
            let now = chrono::Utc::now();
            m.response_body_start = Some(now);
            m.response_body_end = Some(now);
        });
        exchange.response = Some(Response {
            header,
            body: Body::empty(),
        });
        // A body the remote sends anyway would desync the next exchange
        completion.complete(true);
        return NextReader::Ready(reader);
    }

    let (framed, next) = if header.is_chunked() {
        reclaimable(ChunkedReader::new(reader))
    } else if header.content_length() > 0 {
        reclaimable(ContentLengthReader::new(reader, header.content_length() as u64))
    } else {
        // Delimited by the remote closing the connection
        (Body::new(reader), NextReader::Closed)
    };

    let first_byte = exchange.metrics.clone();
    let end = exchange.metrics.clone();
    let error = exchange.metrics.clone();
    let failed = completion.clone();
    let body = MetricsStream::new(framed)
        .on_first_byte(move || first_byte.stamp(|m| &mut m.response_body_start))
        .on_end(move |total| {
            end.update(|m| {
                m.response_body_end = Some(chrono::Utc::now());
                m.total_received += total;
            });
            completion.complete(should_close);
        })
        .on_error(move |reason| {
            error.stamp(|m| &mut m.response_body_end);
            failed.fail(reason);
        });

    exchange.response = Some(Response {
        header,
        body: Body::new(body),
    });
    next
}

/// Result of writing a response back to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseWriteOutcome {
    pub body_bytes: u64,
    /// The client connection cannot carry another exchange
    pub close_client: bool,
}

/// Write the response of `exchange` to the client.
///
/// Bodies of unknown length are re-chunked when they come from an HTTP/2
/// stream; an HTTP/1.1 close-delimited body forces the client connection to close.
pub async fn write_response<W>(
    exchange: &mut Exchange,
    writer: &mut W,
    mut close_client: bool,
    buffer_size: usize,
) -> Result<ResponseWriteOutcome, ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let method = exchange.request.header.method().to_string();
    let mut alterations = exchange.context.response_header_alterations.clone();
    let Some(response) = exchange.response.as_mut() else {
        return Err(ProxyError::ConnectionClosed);
    };

    let mut chunked = response.header.is_chunked();
    if response.header.is_close_delimited(&method) {
        if response.header.version() == "HTTP/2" {
            alterations.push(HeaderAlteration::replace(
                "Transfer-Encoding",
                "chunked",
                true,
            ));
            chunked = true;
        } else {
            close_client = true;
        }
    }
    close_client |= response.header.connection_close_request();

    let mut buf = BytesMut::with_capacity(1024);
    // A 101 keeps its Connection/Upgrade fields for the client
    let skip_non_forwardable = response.header.status_code() != 101;
    response
        .header
        .write_http11(&alterations, skip_non_forwardable, &mut buf);
    if close_client {
        // Replace the terminating blank line
        buf.truncate(buf.len() - 2);
        buf.put_slice(b"Connection: close\r\n\r\n");
    }
    writer.write_all(&buf).await.map_err(ProxyError::Downstream)?;

    let mut body = response.take_body();
    let body_bytes = if body.is_empty() {
        writer.flush().await.map_err(ProxyError::Downstream)?;
        0
    } else {
        copy_body(&mut body, writer, chunked, buffer_size)
            .await
            .map_err(|e| match e {
                CopyError::Read(e) => ProxyError::Io(e),
                CopyError::Write(e) => ProxyError::Downstream(e),
            })?
    };

    Ok(ResponseWriteOutcome {
        body_bytes,
        close_client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::Authority;
    use crate::exchange::{CompletionState, ExchangeContext, Request};
    use crate::http::header::RequestHeader;
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt};

    fn exchange(raw: &[u8], body: Body) -> Exchange {
        let header = RequestHeader::parse(raw, false, None).unwrap();
        Exchange::new(
            1,
            Authority::new("example.com", 80, false),
            ExchangeContext::new(),
            Request::new(header, body),
        )
    }

    fn remote(data: &'static [u8]) -> ConnectionReader {
        ConnectionReader::with_buffer(Box::new(tokio::io::empty()), BytesMut::from(data))
    }

    #[tokio::test]
    async fn test_process_content_length_response() {
        let mut ex = exchange(
            b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\nProxy-Connection: keep-alive\r\n\r\n",
            Body::from_bytes(Bytes::from_static(b"abc")),
        );
        let mut sent = Vec::new();
        let reader = remote(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloNEXT");

        let next = process(&mut ex, reader, &mut sent, &H11Options::default())
            .await
            .unwrap();

        let sent = String::from_utf8(sent).unwrap();
        assert!(sent.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(!sent.to_lowercase().contains("proxy-connection"));
        assert!(sent.ends_with("\r\n\r\nabc"));

        let mut response = ex.response.take().unwrap();
        assert_eq!(response.header.status_code(), 200);
        assert_eq!(response.body.read_to_vec().await.unwrap(), b"hello");
        drop(response);

        assert_eq!(
            ex.completion().wait().await,
            CompletionState::Completed {
                close_connection: false
            }
        );
        let reader = next.reclaim().await.unwrap();
        assert_eq!(reader.buffered(), b"NEXT");

        let metrics = ex.metrics.snapshot();
        assert!(metrics.response_body_end.is_some());
        assert!(metrics.total_sent > 3);
    }

    #[tokio::test]
    async fn test_bodiless_status_forces_close() {
        for status in [204u16, 205, 304] {
            let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", Body::empty());
            let raw = format!("HTTP/1.1 {} X\r\nContent-Length: 10\r\n\r\n", status);
            let reader = ConnectionReader::with_buffer(
                Box::new(tokio::io::empty()),
                BytesMut::from(raw.as_bytes()),
            );
            let mut sink = Vec::new();
            process(&mut ex, reader, &mut sink, &H11Options::default())
                .await
                .unwrap();
            assert!(ex.response.as_ref().unwrap().body.is_empty());
            assert_eq!(
                ex.completion().state(),
                CompletionState::Completed {
                    close_connection: true
                }
            );
        }
    }

    #[tokio::test]
    async fn test_empty_body_closes_connection() {
        for (method, raw) in [
            ("GET", &b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"[..]),
            ("HEAD", &b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n"[..]),
        ] {
            let request = format!("{} / HTTP/1.1\r\nHost: example.com\r\n\r\n", method);
            let mut ex = exchange(request.as_bytes(), Body::empty());
            let mut sink = Vec::new();
            process(&mut ex, remote(raw), &mut sink, &H11Options::default())
                .await
                .unwrap();
            assert!(ex.response.as_ref().unwrap().body.is_empty());
            assert_eq!(
                ex.completion().state(),
                CompletionState::Completed {
                    close_connection: true
                },
                "{}",
                method
            );
        }
    }

    #[tokio::test]
    async fn test_interim_response_is_skipped() {
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", Body::empty());
        let reader = remote(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let mut sink = Vec::new();
        process(&mut ex, reader, &mut sink, &H11Options::default())
            .await
            .unwrap();
        assert_eq!(ex.status_code(), Some(200));
    }

    #[tokio::test]
    async fn test_chunked_response_closes_after_completion() {
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", Body::empty());
        let reader = remote(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\ntest\r\n0\r\n\r\n");
        let mut sink = Vec::new();
        process(&mut ex, reader, &mut sink, &H11Options::default())
            .await
            .unwrap();

        let mut client = Vec::new();
        let outcome = write_response(&mut ex, &mut client, false, 1024).await.unwrap();
        assert_eq!(outcome.body_bytes, 4);
        assert!(String::from_utf8_lossy(&client).ends_with("4\r\ntest\r\n0\r\n\r\n"));
        assert_eq!(
            ex.completion().state(),
            CompletionState::Completed {
                close_connection: true
            }
        );
    }

    #[tokio::test]
    async fn test_remote_closing_before_header() {
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", Body::empty());
        let mut sink = Vec::new();
        let err = process(&mut ex, remote(b""), &mut sink, &H11Options::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_delimited_response_closes_client() {
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", Body::empty());
        let (mut tx, rx) = duplex(256);
        tx.write_all(b"HTTP/1.1 200 OK\r\n\r\nuntil close").await.unwrap();
        drop(tx);

        let mut sink = Vec::new();
        let next = process(
            &mut ex,
            ConnectionReader::new(Box::new(rx)),
            &mut sink,
            &H11Options::default(),
        )
        .await
        .unwrap();
        assert!(matches!(next, NextReader::Closed));

        let (mut client_tx, mut client_rx) = duplex(1024);
        let outcome = write_response(&mut ex, &mut client_tx, false, 64).await.unwrap();
        assert!(outcome.close_client);
        drop(client_tx);

        let mut written = String::new();
        client_rx.read_to_string(&mut written).await.unwrap();
        assert!(written.contains("Connection: close\r\n\r\nuntil close"));
    }

    #[tokio::test]
    async fn test_response_alterations_applied_on_write() {
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", Body::empty());
        ex.context
            .response_header_alterations
            .push(HeaderAlteration::add("X-Intercepted", "1"));
        let reader = remote(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nServer: x\r\n\r\nok");
        let mut sink = Vec::new();
        process(&mut ex, reader, &mut sink, &H11Options::default())
            .await
            .unwrap();

        let mut client = Vec::new();
        write_response(&mut ex, &mut client, false, 64).await.unwrap();
        let text = String::from_utf8(client).unwrap();
        assert_eq!(
            text,
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nServer: x\r\nX-Intercepted: 1\r\n\r\nok"
        );
    }
}
