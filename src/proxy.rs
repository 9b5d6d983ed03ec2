//! Listener, accept loop and per-client-connection processing
//!
//! Every accepted socket gets its own task. The first header block decides
//! the connection mode (see [`ClientSetup`]); exchanges on one client
//! connection are then processed strictly one after another: the response
//! of an exchange is fully written before the next request header is read.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveUpdate, UpdateType};
use crate::authority::Authority;
use crate::error::{ExchangeError, ProxyError};
use crate::exchange::builder::{ClientAddresses, ClientSetup};
use crate::exchange::{Exchange, PreMadeResponse, Response};
use crate::http::body::Body;
use crate::http::h11;
use crate::http::header::{HeaderField, ResponseHeader};
use crate::http::responses::{bad_request, error_response};
use crate::proxy_metrics;
use crate::rules::FilterScope;
use crate::runtime::ProxyRuntimeContext;
use crate::stream::{splice, BoxedWriter, ConnectionReader, NextReader, UpgradedLink};

/// A running (or startable) proxy instance
pub struct Proxy {
    runtime: Arc<ProxyRuntimeContext>,
    tracker: TaskTracker,
    /// Aborts client connections still open once the drain budget is spent
    force: CancellationToken,
    endpoints: Vec<SocketAddr>,
}

impl Proxy {
    pub fn new(runtime: Arc<ProxyRuntimeContext>) -> Self {
        Self {
            runtime,
            tracker: TaskTracker::new(),
            force: CancellationToken::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<ProxyRuntimeContext> {
        &self.runtime
    }

    /// Addresses actually bound (resolves port 0)
    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    /// Cancelled when the proxy stops accepting, including when the exchange
    /// limit is reached
    pub fn shutdown_token(&self) -> CancellationToken {
        self.runtime.shutdown.clone()
    }

    /// Bind every configured endpoint and start accepting clients
    pub async fn start(&mut self) -> Result<Vec<SocketAddr>, ProxyError> {
        if !self.endpoints.is_empty() {
            return Err(ProxyError::Config("proxy already started".to_string()));
        }

        let mut listeners = Vec::with_capacity(self.runtime.settings.bound_points.len());
        for point in &self.runtime.settings.bound_points {
            let listener = TcpListener::bind(point).await?;
            let local = listener.local_addr()?;
            info!(address = %local, "Proxy listening");
            listeners.push((listener, local));
        }

        for (listener, local) in listeners {
            self.endpoints.push(local);
            self.tracker.spawn(accept_loop(
                listener,
                self.runtime.clone(),
                self.tracker.clone(),
                self.force.clone(),
            ));
        }
        Ok(self.endpoints.clone())
    }

    /// Stop accepting, wait for in-flight client connections within the retry
    /// budget, then abort what is left and dispose every pool
    pub async fn shutdown(self) {
        let settings = &self.runtime.settings;
        info!(
            active = self.tracker.len(),
            "Shutting down proxy"
        );
        self.runtime.shutdown.cancel();
        self.tracker.close();

        let interval = Duration::from_millis(settings.shutdown_poll_interval_ms.max(1));
        let mut drained = self.tracker.is_empty();
        for _ in 0..settings.shutdown_retry_budget {
            if drained {
                break;
            }
            tokio::time::sleep(interval).await;
            drained = self.tracker.is_empty();
        }

        if !drained {
            warn!(
                remaining = self.tracker.len(),
                "Drain budget exhausted, aborting client connections"
            );
            self.force.cancel();
            if tokio::time::timeout(interval, self.tracker.wait()).await.is_err() {
                warn!(remaining = self.tracker.len(), "Tasks still running after abort");
            }
        }

        self.runtime.pools.dispose_all();
        info!("Proxy stopped");
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("endpoints", &self.endpoints)
            .field("active", &self.tracker.len())
            .finish()
    }
}

/// Keeps the active client connection gauge in sync with task lifetimes
struct ActiveClient;

impl ActiveClient {
    fn enter() -> Self {
        proxy_metrics::ACTIVE_CLIENT_CONNECTIONS.inc();
        Self
    }
}

impl Drop for ActiveClient {
    fn drop(&mut self) {
        proxy_metrics::ACTIVE_CLIENT_CONNECTIONS.dec();
    }
}

async fn accept_loop(
    listener: TcpListener,
    runtime: Arc<ProxyRuntimeContext>,
    tracker: TaskTracker,
    force: CancellationToken,
) {
    loop {
        let (stream, client) = tokio::select! {
            _ = runtime.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Typically fd exhaustion; back off instead of spinning
                    error!(error = %e, "Failed to accept client connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let _ = stream.set_nodelay(true);
        let addresses = ClientAddresses {
            client: Some(client),
            local: stream.local_addr().ok(),
        };
        let runtime = runtime.clone();
        let force = force.clone();
        tracker.spawn(async move {
            let _active = ActiveClient::enter();
            tokio::select! {
                result = serve_client(&runtime, stream, addresses) => {
                    if let Err(e) = result {
                        log_connection_error(&e, client);
                    }
                }
                _ = force.cancelled() => {
                    debug!(client = %client, "Client connection aborted by shutdown");
                }
            }
        });
    }

    if let Ok(local) = listener.local_addr() {
        info!(address = %local, "Listener closed");
    }
}

fn log_connection_error(error: &ProxyError, client: SocketAddr) {
    if error.is_cancellation() {
        debug!(client = %client, "Client connection cancelled");
    } else if error.is_client_error() {
        debug!(client = %client, error = %error, "Client connection ended with a client error");
    } else {
        warn!(client = %client, error = %error, "Client connection failed");
    }
}

async fn serve_client(
    runtime: &Arc<ProxyRuntimeContext>,
    stream: TcpStream,
    addresses: ClientAddresses,
) -> Result<(), ProxyError> {
    let Some(setup) = runtime
        .exchanges
        .init_client_connection(Box::new(stream), addresses)
        .await?
    else {
        debug!(client = ?addresses.client, "Client closed before sending a request");
        return Ok(());
    };

    match setup {
        ClientSetup::Tunnel {
            exchange,
            reader,
            writer,
        } => tunnel(runtime, exchange, reader, writer).await,
        ClientSetup::Intercepted {
            authority,
            exchange,
            reader,
            writer,
        } => {
            let metrics = exchange.metrics.snapshot();
            debug!(
                exchange_id = exchange.id,
                authority = %authority,
                certificate_ms = metrics
                    .create_cert_start
                    .zip(metrics.create_cert_end)
                    .map(|(start, end)| (end - start).num_milliseconds()),
                "Serving decrypted client connection"
            );
            serve_exchanges(runtime, None, Some(reader), writer, Some(authority), addresses).await
        }
        ClientSetup::Plain {
            exchange,
            next,
            writer,
        } => {
            serve_exchanges(runtime, Some((exchange, next)), None, writer, None, addresses).await
        }
    }
}

/// Blind CONNECT: relay bytes both ways without looking at them
async fn tunnel(
    runtime: &Arc<ProxyRuntimeContext>,
    mut exchange: Exchange,
    client: ConnectionReader,
    writer: BoxedWriter,
) -> Result<(), ProxyError> {
    let started = Instant::now();
    runtime
        .archive
        .update(ArchiveUpdate::exchange(UpdateType::BeforeRequestHeader, &exchange));

    if let Err(e) = forward(runtime, &mut exchange).await {
        // The CONNECT was already acknowledged; closing is the only signal left
        fail(runtime, &mut exchange, &e, started);
        return Err(e);
    }

    let Some(link) = exchange.upgrade.take() else {
        return Err(ProxyError::ConnectionClosed);
    };
    relay(runtime, exchange, client, writer, link, started).await;
    Ok(())
}

/// Process exchanges of one client connection in order
async fn serve_exchanges(
    runtime: &Arc<ProxyRuntimeContext>,
    mut pending: Option<(Exchange, NextReader)>,
    mut reader: Option<ConnectionReader>,
    mut writer: BoxedWriter,
    authority: Option<Authority>,
    addresses: ClientAddresses,
) -> Result<(), ProxyError> {
    loop {
        let (exchange, next) = match pending.take() {
            Some(current) => current,
            None => {
                let Some(current) = reader.take() else {
                    return Ok(());
                };
                let read = tokio::select! {
                    read = runtime.exchanges.read_exchange(current, authority.as_ref(), addresses) => read,
                    _ = runtime.shutdown.cancelled() => {
                        debug!(client = ?addresses.client, "Closing idle client connection on shutdown");
                        return Ok(());
                    }
                };
                match read {
                    Ok(Some(current)) => current,
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        if matches!(e, ProxyError::Exchange(_)) {
                            let _ = writer.write_all(&bad_request(&e).to_http11()).await;
                            let _ = writer.flush().await;
                        }
                        return Err(e);
                    }
                }
            }
        };

        match process_exchange(runtime, exchange, next, &mut writer).await? {
            ExchangeFlow::Continue(next_reader) => reader = Some(next_reader),
            ExchangeFlow::Close => return Ok(()),
            ExchangeFlow::Upgrade {
                exchange,
                client,
                link,
                started,
            } => {
                relay(runtime, *exchange, client, writer, link, started).await;
                return Ok(());
            }
        }
    }
}

/// What the client connection does after an exchange
enum ExchangeFlow {
    Continue(ConnectionReader),
    Upgrade {
        exchange: Box<Exchange>,
        client: ConnectionReader,
        link: UpgradedLink,
        started: Instant,
    },
    Close,
}

async fn process_exchange(
    runtime: &Arc<ProxyRuntimeContext>,
    mut exchange: Exchange,
    next: NextReader,
    writer: &mut BoxedWriter,
) -> Result<ExchangeFlow, ProxyError> {
    let started = Instant::now();
    let rules = &runtime.rules;
    runtime
        .archive
        .update(ArchiveUpdate::exchange(UpdateType::BeforeRequestHeader, &exchange));

    rules
        .enforce_on_exchange(FilterScope::RequestHeaderReceivedFromClient, &mut exchange, None)
        .await;
    let close_client = exchange.request.header.connection_close_request();

    let outcome = match exchange.context.pre_made_response.take() {
        Some(premade) => {
            debug!(
                exchange_id = exchange.id,
                status = premade.status,
                "Serving premade response"
            );
            exchange.response = Some(premade_response(&premade)?);
            exchange.completion().complete(false);
            "mocked"
        }
        None => {
            if let Err(e) = forward(runtime, &mut exchange).await {
                fail(runtime, &mut exchange, &e, started);
                if !e.is_cancellation() {
                    let response =
                        error_response(&e, runtime.settings.error_status_code, exchange.id);
                    let _ = writer.write_all(&response.to_http11()).await;
                    let _ = writer.flush().await;
                }
                return Ok(ExchangeFlow::Close);
            }

            let connection = exchange.connection.clone();
            rules
                .enforce_on_exchange(
                    FilterScope::RequestBodyReceivedFromClient,
                    &mut exchange,
                    connection.as_deref(),
                )
                .await;
            rules
                .enforce_on_exchange(
                    FilterScope::ResponseHeaderReceivedFromRemote,
                    &mut exchange,
                    connection.as_deref(),
                )
                .await;
            "completed"
        }
    };

    runtime
        .archive
        .update(ArchiveUpdate::exchange(UpdateType::AfterResponseHeader, &exchange));

    let written = match h11::write_response(
        &mut exchange,
        writer,
        close_client,
        runtime.settings.buffer_size,
    )
    .await
    {
        Ok(written) => written,
        Err(e) => {
            fail(runtime, &mut exchange, &e, started);
            return Err(e);
        }
    };
    debug!(
        exchange_id = exchange.id,
        status = exchange.status_code(),
        body_bytes = written.body_bytes,
        "Response written"
    );

    // The remote may answer before reading the whole request body
    let client = match exchange.request.body.drain().await {
        Ok(_) => next.reclaim().await,
        Err(_) => None,
    };

    if let Some(link) = exchange.upgrade.take() {
        return Ok(match client {
            Some(client) => ExchangeFlow::Upgrade {
                exchange: Box::new(exchange),
                client,
                link,
                started,
            },
            None => {
                finish(runtime, &exchange, "failed", started);
                ExchangeFlow::Close
            }
        });
    }

    finish(runtime, &exchange, outcome, started);
    Ok(match client {
        Some(client) if !written.close_client => ExchangeFlow::Continue(client),
        _ => ExchangeFlow::Close,
    })
}

/// Pick the pool for the exchange and send it to the remote
async fn forward(
    runtime: &Arc<ProxyRuntimeContext>,
    exchange: &mut Exchange,
) -> Result<(), ProxyError> {
    let pool = runtime.pools.get_pool(exchange).await?;
    pool.send(exchange).await?;

    if let Some(connection) = &exchange.connection {
        if !exchange.metrics.snapshot().reused_connection {
            runtime.archive.update(ArchiveUpdate::connection(connection));
        }
    }
    Ok(())
}

/// Splice the client with the remote link until either side closes
async fn relay(
    runtime: &Arc<ProxyRuntimeContext>,
    exchange: Exchange,
    client: ConnectionReader,
    writer: BoxedWriter,
    link: UpgradedLink,
    started: Instant,
) {
    let outcome = splice(
        client,
        writer,
        link.reader,
        link.writer,
        runtime.settings.buffer_size,
    )
    .await;
    exchange.metrics.update(|m| {
        m.total_sent += outcome.sent;
        m.total_received += outcome.received;
        m.remote_closed = Some(chrono::Utc::now());
    });
    debug!(
        exchange_id = exchange.id,
        authority = %exchange.authority,
        sent = outcome.sent,
        received = outcome.received,
        "Relay finished"
    );
    let label = if exchange.tunneled_only {
        "tunneled"
    } else {
        "upgraded"
    };
    finish(runtime, &exchange, label, started);
}

fn fail(
    runtime: &Arc<ProxyRuntimeContext>,
    exchange: &mut Exchange,
    error: &ProxyError,
    started: Instant,
) {
    exchange.record_error(error);
    exchange.completion().fail(error.to_string());
    if error.is_cancellation() {
        debug!(exchange_id = exchange.id, "Exchange cancelled");
        finish(runtime, exchange, "cancelled", started);
        return;
    }

    proxy_metrics::record_exchange_error(error.kind());
    warn!(
        exchange_id = exchange.id,
        authority = %exchange.authority,
        error = %error,
        "Exchange failed"
    );
    finish(runtime, exchange, "failed", started);
}

fn finish(
    runtime: &Arc<ProxyRuntimeContext>,
    exchange: &Exchange,
    outcome: &str,
    started: Instant,
) {
    runtime
        .archive
        .update(ArchiveUpdate::exchange(UpdateType::AfterResponse, exchange));
    proxy_metrics::record_exchange(outcome, exchange.status_code(), started.elapsed());
}

/// Turn a premade response into a regular response so header alterations
/// and the HTTP/1.1 writer apply to it
fn premade_response(premade: &PreMadeResponse) -> Result<Response, ExchangeError> {
    let mut fields: Vec<HeaderField> = premade
        .headers
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("transfer-encoding")
        })
        .map(|(name, value)| HeaderField::new(name.as_str(), value.as_str()))
        .collect();
    fields.push(HeaderField::new(
        "Content-Length",
        premade.body.len().to_string(),
    ));
    let header = ResponseHeader::from_parts(premade.status, "HTTP/1.1", fields)?;
    let body = if premade.body.is_empty() {
        Body::empty()
    } else {
        Body::from_bytes(premade.body.clone())
    };
    Ok(Response { header, body })
}
