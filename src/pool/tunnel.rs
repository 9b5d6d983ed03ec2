//! Blind tunnel pool
//!
//! Opens a raw TCP connection (no TLS even for secure authorities) and hands
//! both halves to the exchange so the proxy can splice them with the client.

use std::sync::Arc;
use tracing::debug;

use crate::authority::Authority;
use crate::error::ProxyError;
use crate::establish::ConnectionBuilder;
use crate::exchange::Exchange;
use crate::stream::{split_stream, ConnectionReader, UpgradedLink};

pub struct TunnelOnlyConnectionPool {
    authority: Authority,
    connections: Arc<ConnectionBuilder>,
}

impl TunnelOnlyConnectionPool {
    pub fn new(authority: Authority, connections: Arc<ConnectionBuilder>) -> Self {
        Self {
            authority,
            connections,
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub async fn send(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        let result = match self
            .connections
            .open(
                &self.authority,
                &mut exchange.context,
                Some(&exchange.metrics),
                false,
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                exchange.completion().fail(e.to_string());
                return Err(e);
            }
        };

        debug!(
            exchange_id = exchange.id,
            connection_id = result.connection.id,
            authority = %self.authority,
            "Blind tunnel opened"
        );

        result.connection.increment_requests();
        let (reader, writer) = split_stream(result.stream);
        exchange.connection = Some(result.connection);
        exchange.upgrade = Some(UpgradedLink {
            reader: ConnectionReader::new(reader),
            writer,
        });
        // The tunnel owns the connection from now on
        exchange.completion().complete(true);
        Ok(())
    }
}
