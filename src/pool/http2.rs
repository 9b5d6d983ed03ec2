//! HTTP/2 connection pool
//!
//! One multiplexed connection per authority, driven by the `h2` crate. HTTP/1.1
//! requests from the client are translated into h2 streams and the response is
//! exposed as a regular [`ResponseHeader`] plus body, so the client side does
//! not need to know which protocol the remote spoke.

use bytes::{Buf, Bytes};
use futures_util::future::poll_fn;
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::authority::Authority;
use crate::connection::Connection;
use crate::error::{ErrorSide, ExchangeError, ProxyError};
use crate::establish::RemoteConnectionResult;
use crate::exchange::{Exchange, Response};
use crate::http::body::{Body, MetricsStream};
use crate::http::header::{HeaderField, ResponseHeader};

/// Connection-scoped fields that HTTP/2 forbids
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Result of the h2 handshake on a freshly negotiated connection
pub struct H2Handshake {
    connection: Arc<Connection>,
    sender: SendRequest<Bytes>,
    driver: h2::client::Connection<crate::stream::BoxedStream, Bytes>,
    buffer_size: usize,
}

pub async fn handshake(
    result: RemoteConnectionResult,
    buffer_size: usize,
) -> Result<H2Handshake, ProxyError> {
    let (sender, driver) = h2::client::handshake(result.stream).await?;
    Ok(H2Handshake {
        connection: result.connection,
        sender,
        driver,
        buffer_size,
    })
}

pub struct H2ConnectionPool {
    authority: Authority,
    connection: Arc<Connection>,
    sender: SendRequest<Bytes>,
    faulted: Arc<AtomicBool>,
    driver: JoinHandle<()>,
    buffer_size: usize,
}

impl H2ConnectionPool {
    /// Spawn the connection driver. `on_fault` runs once the connection ends.
    pub fn new(
        authority: Authority,
        handshake: H2Handshake,
        on_fault: impl FnOnce() + Send + 'static,
    ) -> Self {
        let faulted = Arc::new(AtomicBool::new(false));
        let flag = faulted.clone();
        let label = authority.clone();
        let driver_future = handshake.driver;
        let driver = tokio::spawn(async move {
            match driver_future.await {
                Ok(()) => debug!(authority = %label, "h2 connection closed"),
                Err(e) => warn!(authority = %label, error = %e, "h2 connection faulted"),
            }
            flag.store(true, Ordering::SeqCst);
            on_fault();
        });

        Self {
            authority,
            connection: handshake.connection,
            sender: handshake.sender,
            faulted,
            driver,
            buffer_size: handshake.buffer_size,
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn check_alive(&self) -> bool {
        !self.faulted.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        self.faulted.store(true, Ordering::SeqCst);
        self.driver.abort();
    }

    pub async fn send(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        let result = self.forward(exchange).await;
        if let Err(e) = &result {
            exchange.completion().fail(e.to_string());
        }
        result
    }

    async fn forward(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        self.connection.increment_requests();
        exchange.connection = Some(self.connection.clone());
        exchange.metrics.update(|m| m.reused_connection = true);

        let request = build_request(exchange)?;
        let mut body = exchange.request.take_body();
        let end_of_stream = body.is_empty();

        let mut sender = self.sender.clone().ready().await?;
        exchange.metrics.stamp(|m| &mut m.request_header_sending);
        let (response, mut stream) = sender.send_request(request, end_of_stream)?;
        exchange.metrics.stamp(|m| &mut m.request_header_sent);

        if !end_of_stream {
            let sent = send_body(&mut body, &mut stream, self.buffer_size).await?;
            exchange.metrics.update(|m| m.total_sent += sent);
        }
        exchange.metrics.stamp(|m| &mut m.request_body_sent);

        exchange.metrics.stamp(|m| &mut m.response_header_start);
        let response = response.await?;
        exchange.metrics.stamp(|m| &mut m.response_header_end);

        let (parts, recv) = response.into_parts();
        let fields = parts
            .headers
            .iter()
            .map(|(name, value)| {
                let value = value.to_str().map_err(|_| ExchangeError::InvalidHeader {
                    side: ErrorSide::Remote,
                    detail: format!("non visible ASCII value for {}", name),
                })?;
                Ok(HeaderField::new(name.as_str(), value))
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        let header = ResponseHeader::from_parts(parts.status.as_u16(), "HTTP/2", fields)?;

        debug!(
            exchange_id = exchange.id,
            status = header.status_code(),
            stream_id = ?recv.stream_id(),
            "h2 response received"
        );

        let method = exchange.request.header.method().to_string();
        let completion = exchange.completion();
        if recv.is_end_stream() || !header.has_response_body(&method) {
            exchange.metrics.update(|m| {
                let now = chrono::Utc::now();
                m.response_body_start = Some(now);
                m.response_body_end = Some(now);
            });
            exchange.response = Some(Response {
                header,
                body: Body::empty(),
            });
            completion.complete(false);
            return Ok(());
        }

        let first_byte = exchange.metrics.clone();
        let end = exchange.metrics.clone();
        let error = exchange.metrics.clone();
        let failed = completion.clone();
        let body = MetricsStream::new(H2BodyReader::new(recv))
            .on_first_byte(move || first_byte.stamp(|m| &mut m.response_body_start))
            .on_end(move |total| {
                end.update(|m| {
                    m.response_body_end = Some(chrono::Utc::now());
                    m.total_received += total;
                });
                completion.complete(false);
            })
            .on_error(move |reason| {
                error.stamp(|m| &mut m.response_body_end);
                failed.fail(reason);
            });

        exchange.response = Some(Response {
            header,
            body: Body::new(body),
        });
        Ok(())
    }
}

impl Drop for H2ConnectionPool {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn build_request(exchange: &Exchange) -> Result<http::Request<()>, ProxyError> {
    let (pseudo, regular) = exchange
        .request
        .header
        .http2_fields(&exchange.context.request_header_alterations);
    let find = |name: &str| {
        pseudo
            .iter()
            .find(|f| f.is(name))
            .map(|f| f.value.clone())
    };

    let method = find(":method").unwrap_or_else(|| "GET".to_string());
    let path = find(":path").unwrap_or_else(|| "/".to_string());
    let uri = format!(
        "{}://{}{}",
        exchange.authority.scheme(),
        exchange.authority.host_header(),
        path
    );

    let invalid = |detail: String| {
        ProxyError::from(ExchangeError::InvalidHeader {
            side: ErrorSide::Client,
            detail,
        })
    };

    let mut builder = http::Request::builder()
        .method(method.as_str())
        .uri(uri.as_str())
        .version(http::Version::HTTP_2);
    for field in regular {
        if CONNECTION_SPECIFIC.iter().any(|n| field.is(n)) {
            continue;
        }
        if field.is("te") && !field.value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        builder = builder.header(field.name.to_ascii_lowercase(), field.value);
    }
    builder
        .body(())
        .map_err(|e| invalid(format!("cannot build h2 request: {}", e)))
}

/// Copy the request body into the h2 stream, respecting flow control
async fn send_body(
    body: &mut Body,
    stream: &mut SendStream<Bytes>,
    buffer_size: usize,
) -> Result<u64, ProxyError> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = body.read(&mut buf).await.map_err(ProxyError::Downstream)?;
        if n == 0 {
            stream.send_data(Bytes::new(), true)?;
            return Ok(total);
        }
        let mut chunk = Bytes::copy_from_slice(&buf[..n]);
        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let granted = poll_fn(|cx| stream.poll_capacity(cx))
                .await
                .ok_or_else(|| ProxyError::Http2("stream closed while sending body".into()))??;
            if granted == 0 {
                continue;
            }
            let part = chunk.split_to(granted.min(chunk.len()));
            stream.send_data(part, false)?;
        }
        total += n as u64;
    }
}

/// `AsyncRead` over an h2 receive stream, releasing flow-control capacity as
/// data is consumed
pub struct H2BodyReader {
    stream: Mutex<RecvStream>,
    pending: Bytes,
    done: bool,
}

impl H2BodyReader {
    pub fn new(stream: RecvStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            pending: Bytes::new(),
            done: false,
        }
    }
}

impl AsyncRead for H2BodyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            let mut stream = this.stream.lock().unwrap_or_else(|e| e.into_inner());
            match stream.poll_data(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    let _ = stream.flow_control().release_capacity(data.len());
                    this.pending = data;
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
                Poll::Ready(None) => this.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
