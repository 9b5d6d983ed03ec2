//! HTTP/1.1 connection pool
//!
//! A semaphore sized to `connection_per_host` bounds the exchanges in flight.
//! Each exchange takes an idle connection (FIFO) or opens a new one; the
//! connection goes back to the idle queue only when the exchange completed
//! without a close request and its response body was fully read.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::PoolSettings;
use crate::authority::Authority;
use crate::connection::Connection;
use crate::error::ProxyError;
use crate::establish::{ConnectionBuilder, RemoteConnectionResult};
use crate::exchange::{Exchange, ExchangeCompletion};
use crate::http::h11::{self, H11Options};
use crate::proxy_metrics;
use crate::stream::{split_stream, BoxedWriter, ConnectionReader, NextReader};

/// Connection waiting for its next exchange
pub struct IdleConnection {
    pub connection: Arc<Connection>,
    reader: ConnectionReader,
    writer: BoxedWriter,
    last_used: Instant,
}

impl IdleConnection {
    fn new(connection: Arc<Connection>, reader: ConnectionReader, writer: BoxedWriter) -> Self {
        Self {
            connection,
            reader,
            writer,
            last_used: Instant::now(),
        }
    }

    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }
}

pub struct Http11ConnectionPool {
    authority: Authority,
    connections: Arc<ConnectionBuilder>,
    semaphore: Arc<Semaphore>,
    idle: Arc<Mutex<VecDeque<IdleConnection>>>,
    idle_timeout: Duration,
    options: H11Options,
}

impl Http11ConnectionPool {
    pub fn new(
        authority: Authority,
        connections: Arc<ConnectionBuilder>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            authority,
            connections,
            semaphore: Arc::new(Semaphore::new(settings.connection_per_host.max(1))),
            idle: Arc::new(Mutex::new(VecDeque::new())),
            idle_timeout: settings.idle_timeout,
            options: settings.h11,
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Hand a freshly opened connection to the pool
    pub fn seed(&self, result: RemoteConnectionResult) {
        let (reader, writer) = split_stream(result.stream);
        self.push_idle(IdleConnection::new(
            result.connection,
            ConnectionReader::new(reader),
            writer,
        ));
    }

    fn push_idle(&self, connection: IdleConnection) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.push_back(connection);
    }

    /// Oldest idle connection that is neither expired nor stale; others are dropped
    pub fn dequeue(&self) -> Option<IdleConnection> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(mut candidate) = idle.pop_front() {
            if candidate.is_expired(self.idle_timeout) {
                debug!(
                    authority = %self.authority,
                    connection_id = candidate.connection.id,
                    "Discarding expired idle connection"
                );
                proxy_metrics::record_upstream_connection("evicted");
                continue;
            }
            if candidate.reader.is_stale() {
                debug!(
                    authority = %self.authority,
                    connection_id = candidate.connection.id,
                    "Discarding idle connection closed by remote"
                );
                proxy_metrics::record_upstream_connection("evicted");
                continue;
            }
            return Some(candidate);
        }
        None
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn check_alive(&self) -> bool {
        !self.semaphore.is_closed()
    }

    pub fn dispose(&self) {
        self.semaphore.close();
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub async fn send(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Cancelled)?;

        let (idle, reused) = match self.dequeue() {
            Some(idle) => {
                proxy_metrics::record_upstream_connection("reused");
                (idle, true)
            }
            None => {
                let result = self
                    .connections
                    .open(
                        &self.authority,
                        &mut exchange.context,
                        Some(&exchange.metrics),
                        true,
                    )
                    .await?;
                let (reader, writer) = split_stream(result.stream);
                (
                    IdleConnection::new(result.connection, ConnectionReader::new(reader), writer),
                    false,
                )
            }
        };

        let IdleConnection {
            connection,
            reader,
            mut writer,
            ..
        } = idle;
        connection.increment_requests();
        exchange.connection = Some(connection.clone());
        exchange.metrics.update(|m| m.reused_connection = reused);

        debug!(
            exchange_id = exchange.id,
            connection_id = connection.id,
            reused,
            "Sending exchange over HTTP/1.1"
        );

        match h11::process(exchange, reader, &mut writer, &self.options).await {
            Ok(next) => {
                tokio::spawn(recycle(
                    permit,
                    exchange.completion(),
                    next,
                    connection,
                    writer,
                    self.idle.clone(),
                ));
                Ok(())
            }
            Err(e) => {
                debug!(
                    exchange_id = exchange.id,
                    connection_id = connection.id,
                    error = %e,
                    "Connection discarded after failure"
                );
                proxy_metrics::record_upstream_connection("discarded");
                exchange.completion().fail(e.to_string());
                Err(e)
            }
        }
    }
}

/// Return the connection to the idle queue once the exchange completes cleanly.
/// The permit is held until then.
async fn recycle(
    _permit: OwnedSemaphorePermit,
    completion: ExchangeCompletion,
    next: NextReader,
    connection: Arc<Connection>,
    writer: BoxedWriter,
    idle: Arc<Mutex<VecDeque<IdleConnection>>>,
) {
    let state = completion.wait().await;
    if !state.allows_reuse() {
        debug!(connection_id = connection.id, state = ?state, "Closing upstream connection");
        return;
    }
    match next.reclaim().await {
        Some(reader) => {
            let mut idle = idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.push_back(IdleConnection::new(connection, reader, writer));
        }
        None => {
            debug!(connection_id = connection.id, "Upstream reader not reclaimable");
        }
    }
}
