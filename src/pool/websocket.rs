//! WebSocket pool
//!
//! Every upgrade gets its own connection. The handshake is forwarded with its
//! `Connection`/`Upgrade` fields intact and ALPN pinned to HTTP/1.1; on `101`
//! the raw streams are handed to the exchange for splicing, otherwise the
//! response is framed like any HTTP/1.1 response.

use std::sync::Arc;
use tracing::debug;

use crate::authority::Authority;
use crate::error::ProxyError;
use crate::establish::ConnectionBuilder;
use crate::exchange::{AlpnProtocol, Exchange, Response};
use crate::http::body::Body;
use crate::http::h11::{self, H11Options};
use crate::stream::{split_stream, ConnectionReader, UpgradedLink};

pub struct WebSocketConnectionPool {
    authority: Authority,
    connections: Arc<ConnectionBuilder>,
    options: H11Options,
}

impl WebSocketConnectionPool {
    pub fn new(authority: Authority, connections: Arc<ConnectionBuilder>, options: H11Options) -> Self {
        Self {
            authority,
            connections,
            options,
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub async fn send(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        let result = self.upgrade(exchange).await;
        if let Err(e) = &result {
            exchange.completion().fail(e.to_string());
        }
        result
    }

    async fn upgrade(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        exchange.context.ssl_application_protocols = Some(vec![AlpnProtocol::Http11]);
        let result = self
            .connections
            .open(
                &self.authority,
                &mut exchange.context,
                Some(&exchange.metrics),
                true,
            )
            .await?;

        result.connection.increment_requests();
        exchange.connection = Some(result.connection.clone());
        let (reader, mut writer) = split_stream(result.stream);
        let mut reader = ConnectionReader::new(reader);

        h11::send_request(exchange, &mut writer, &self.options, false).await?;
        let header = h11::read_response_header(exchange, &mut reader, &self.options).await?;

        if header.status_code() == 101 {
            debug!(
                exchange_id = exchange.id,
                connection_id = result.connection.id,
                "WebSocket upgrade accepted"
            );
            exchange.response = Some(Response {
                header,
                body: Body::empty(),
            });
            exchange.upgrade = Some(UpgradedLink { reader, writer });
            exchange.completion().complete(true);
            return Ok(());
        }

        debug!(
            exchange_id = exchange.id,
            status = header.status_code(),
            "WebSocket upgrade refused by remote"
        );
        // Plain response; the connection is not reused
        let _ = h11::frame_response(exchange, header, reader);
        Ok(())
    }
}
