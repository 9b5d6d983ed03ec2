//! Downstream exchange builder
//!
//! Turns client bytes into exchanges. The first header block of a client
//! connection decides its mode:
//!
//! - `CONNECT`: the canned `200` is written first, then rules decide between a
//!   blind tunnel and TLS interception with a leaf certificate
//! - anything else: a plaintext proxy request (absolute form) or a request to
//!   the proxy itself (origin form)
//!
//! Later requests on the same connection go through [`ExchangeBuilder::read_exchange`].

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::{Exchange, ExchangeContext, IdGenerator, Request};
use crate::authority::Authority;
use crate::certificate::CertificateProvider;
use crate::error::{ErrorSide, ProxyError};
use crate::establish::tls::downstream_server_config;
use crate::http::body::{reclaimable, Body, ChunkedReader, ContentLengthReader};
use crate::http::detect::{read_header, read_header_block};
use crate::http::header::{authority_of, RequestHeader};
use crate::http::responses::{bad_request, CONNECT_ESTABLISHED};
use crate::rules::{FilterScope, RuleEngine};
use crate::stream::{split_stream, BoxedStream, BoxedWriter, ConnectionReader, NextReader, PrefixedStream};

/// Endpoints of a client connection, copied into every exchange it carries
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientAddresses {
    pub client: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
}

/// Outcome of the first header block of a client connection
pub enum ClientSetup {
    /// Blind CONNECT: relay bytes to the remote without decryption
    Tunnel {
        exchange: Exchange,
        reader: ConnectionReader,
        writer: BoxedWriter,
    },
    /// Decrypted CONNECT: requests are read from the TLS streams for `authority`.
    /// `exchange` stands for the CONNECT itself and carries certificate timings.
    Intercepted {
        authority: Authority,
        exchange: Exchange,
        reader: ConnectionReader,
        writer: BoxedWriter,
    },
    /// Plaintext request ready to be forwarded
    Plain {
        exchange: Exchange,
        next: NextReader,
        writer: BoxedWriter,
    },
}

pub struct ExchangeBuilder {
    rules: Arc<RuleEngine>,
    certificates: Arc<dyn CertificateProvider>,
    ids: Arc<IdGenerator>,
    max_header_length: usize,
}

impl ExchangeBuilder {
    pub fn new(
        rules: Arc<RuleEngine>,
        certificates: Arc<dyn CertificateProvider>,
        ids: Arc<IdGenerator>,
        max_header_length: usize,
    ) -> Self {
        Self {
            rules,
            certificates,
            ids,
            max_header_length,
        }
    }

    /// Read the first request of a client connection.
    ///
    /// `Ok(None)` when the client closed without sending anything. Unparsable
    /// requests are answered with `400` before the error is returned.
    pub async fn init_client_connection(
        &self,
        mut stream: BoxedStream,
        addresses: ClientAddresses,
    ) -> Result<Option<ClientSetup>, ProxyError> {
        let mut buffer = BytesMut::new();
        let Some(block) = read_header_block(
            &mut stream,
            &mut buffer,
            self.max_header_length,
            ErrorSide::Client,
            false,
        )
        .await?
        else {
            return Ok(None);
        };

        let local = addresses.local.map(|a| Authority::new(a.ip().to_string(), a.port(), false));
        let header = match RequestHeader::parse(&block, false, local.as_ref()) {
            Ok(header) => header,
            Err(e) => {
                let error = ProxyError::from(e);
                let _ = stream.write_all(&bad_request(&error).to_http11()).await;
                return Err(error);
            }
        };

        if header.is_connect() {
            return self
                .accept_connect(stream, buffer, header, addresses)
                .await
                .map(Some);
        }

        let authority = match authority_of(&header, false) {
            Ok(authority) => authority,
            Err(e) => {
                let error = ProxyError::from(e);
                let _ = stream.write_all(&bad_request(&error).to_http11()).await;
                return Err(error);
            }
        };

        let (reader, writer) = split_stream(stream);
        let reader = ConnectionReader::with_buffer(reader, buffer);
        let mut context = ExchangeContext::new();
        context.is_self = is_origin_form(&block);
        let (exchange, next) = self
            .build(header, reader, authority, context, addresses)
            .await;
        Ok(Some(ClientSetup::Plain {
            exchange,
            next,
            writer,
        }))
    }

    async fn accept_connect(
        &self,
        mut stream: BoxedStream,
        buffer: BytesMut,
        header: RequestHeader,
        addresses: ClientAddresses,
    ) -> Result<ClientSetup, ProxyError> {
        // Always answered before rules run or any handshake starts
        stream
            .write_all(CONNECT_ESTABLISHED)
            .await
            .map_err(ProxyError::Downstream)?;
        stream.flush().await.map_err(ProxyError::Downstream)?;

        let authority = authority_of(&header, true)?;
        let mut context = ExchangeContext::new();
        self.rules
            .enforce_on_authority(FilterScope::OnAuthorityReceived, &mut context, &authority)
            .await;

        let blind = context.blind_mode;
        let mut exchange = Exchange::new(
            self.ids.next(),
            authority.clone(),
            context,
            Request::new(header, Body::empty()),
        );
        stamp_addresses(&exchange, addresses);

        if blind {
            debug!(exchange_id = exchange.id, authority = %authority, "CONNECT tunneled blind");
            exchange.tunneled_only = true;
            let (reader, writer) = split_stream(stream);
            return Ok(ClientSetup::Tunnel {
                exchange,
                reader: ConnectionReader::with_buffer(reader, buffer),
                writer,
            });
        }

        exchange.metrics.stamp(|m| &mut m.create_cert_start);
        let leaf = self.certificates.get_certificate(authority.host_name()).await?;
        exchange.metrics.stamp(|m| &mut m.create_cert_end);

        let acceptor = TlsAcceptor::from(downstream_server_config(&leaf)?);
        let tls = acceptor
            .accept(PrefixedStream::new(buffer, stream))
            .await
            .map_err(|e| ProxyError::tls(authority.host_name(), e))?;

        debug!(exchange_id = exchange.id, authority = %authority, "CONNECT intercepted");
        let (reader, writer) = split_stream(Box::new(tls));
        Ok(ClientSetup::Intercepted {
            authority,
            exchange,
            reader: ConnectionReader::new(reader),
            writer,
        })
    }

    /// Read the next request of an established client connection.
    ///
    /// `authority` is the intercepted CONNECT target, `None` on plaintext
    /// connections. `Ok(None)` when the client closed between requests.
    pub async fn read_exchange(
        &self,
        mut reader: ConnectionReader,
        authority: Option<&Authority>,
        addresses: ClientAddresses,
    ) -> Result<Option<(Exchange, NextReader)>, ProxyError> {
        let Some(block) =
            read_header(&mut reader, self.max_header_length, ErrorSide::Client, false).await?
        else {
            return Ok(None);
        };

        let secure = authority.is_some();
        let local = addresses.local.map(|a| Authority::new(a.ip().to_string(), a.port(), false));
        let default_authority = authority.or(local.as_ref());
        let header = RequestHeader::parse(&block, secure, default_authority)?;

        let mut context = ExchangeContext::new();
        let target = match authority {
            Some(authority) => authority.clone(),
            None => {
                context.is_self = is_origin_form(&block);
                authority_of(&header, false)?
            }
        };
        Ok(Some(self.build(header, reader, target, context, addresses).await))
    }

    async fn build(
        &self,
        header: RequestHeader,
        reader: ConnectionReader,
        authority: Authority,
        mut context: ExchangeContext,
        addresses: ClientAddresses,
    ) -> (Exchange, NextReader) {
        self.rules
            .enforce_on_authority(FilterScope::OnAuthorityReceived, &mut context, &authority)
            .await;

        let (body, next) = if header.is_chunked() {
            reclaimable(ChunkedReader::new(reader))
        } else if header.content_length() > 0 {
            reclaimable(ContentLengthReader::new(reader, header.content_length() as u64))
        } else {
            (Body::empty(), NextReader::Ready(reader))
        };

        let exchange = Exchange::new(self.ids.next(), authority, context, Request::new(header, body));
        stamp_addresses(&exchange, addresses);
        exchange.metrics.update(|m| {
            m.request_header_length = exchange.request.header.raw_length();
        });
        debug!(
            exchange_id = exchange.id,
            authority = %exchange.authority,
            method = exchange.request.header.method(),
            path = exchange.request.header.path(),
            "Exchange received"
        );
        (exchange, next)
    }
}

fn stamp_addresses(exchange: &Exchange, addresses: ClientAddresses) {
    exchange.metrics.update(|m| {
        m.downstream_client_address = addresses.client;
        m.downstream_local_address = addresses.local;
    });
}

/// Request target is a path (`GET / HTTP/1.1`), not an absolute URI
fn is_origin_form(block: &[u8]) -> bool {
    block
        .split(|b| *b == b' ')
        .nth(1)
        .map(|target| target.starts_with(b"/"))
        .unwrap_or(false)
}
