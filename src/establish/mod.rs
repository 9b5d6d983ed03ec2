//! Remote connection establishment: DNS → TCP → (TLS with ALPN)

pub mod dns;
pub mod tcp;
pub mod tls;

pub use dns::{DnsSolver, SystemDnsSolver};
pub use tcp::{DefaultTcpConnectionProvider, TcpConnection, TcpConnectionProvider};
pub use tls::UpstreamTlsFactory;

use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::authority::Authority;
use crate::connection::{Connection, ConnectionTimings, HttpVersion, SslInfo};
use crate::error::ProxyError;
use crate::exchange::{ExchangeContext, IdGenerator, SharedMetrics};
use crate::proxy_metrics;
use crate::rules::{FilterScope, RuleEngine};
use crate::stream::BoxedStream;

/// Protocol to speak on a freshly opened connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteConnectionResultType {
    Http11,
    Http2,
}

pub struct RemoteConnectionResult {
    pub kind: RemoteConnectionResultType,
    pub connection: Arc<Connection>,
    pub stream: BoxedStream,
}

/// Opens remote connections
pub struct ConnectionBuilder {
    dns: Arc<dyn DnsSolver>,
    tcp: Arc<dyn TcpConnectionProvider>,
    tls: Arc<UpstreamTlsFactory>,
    rules: Arc<RuleEngine>,
    ids: Arc<IdGenerator>,
}

impl ConnectionBuilder {
    pub fn new(
        dns: Arc<dyn DnsSolver>,
        tcp: Arc<dyn TcpConnectionProvider>,
        tls: Arc<UpstreamTlsFactory>,
        rules: Arc<RuleEngine>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            dns,
            tcp,
            tls,
            rules,
            ids,
        }
    }

    /// Open a connection to `authority`.
    ///
    /// TLS is negotiated only when the authority is secure and `tls` is set;
    /// blind tunnels pass `tls = false` to get the raw TCP stream.
    pub async fn open(
        &self,
        authority: &Authority,
        context: &mut ExchangeContext,
        metrics: Option<&SharedMetrics>,
        tls: bool,
    ) -> Result<RemoteConnectionResult, ProxyError> {
        let mut timings = ConnectionTimings::default();

        timings.dns_solve_start = Some(Utc::now());
        let ip = match context.remote_host_ip {
            Some(ip) => ip,
            None => self.dns.solve(authority.host_name()).await?,
        };
        timings.dns_solve_end = Some(Utc::now());

        // Rules may still redirect the connection once the address is known
        self.rules
            .enforce_on_authority(FilterScope::DnsSolveDone, context, authority)
            .await;
        let ip = context.remote_host_ip.unwrap_or(ip);
        let port = context.remote_host_port.unwrap_or(authority.port());
        let remote = SocketAddr::new(ip, port);

        timings.tcp_connection_opening = Some(Utc::now());
        let mut tcp = self.tcp.create(&authority.to_string());
        let local = tcp
            .connect(remote)
            .await
            .map_err(|source| ProxyError::Connect {
                addr: remote,
                source,
            })?;
        let stream = tcp.into_stream()?;
        timings.tcp_connection_opened = Some(Utc::now());

        debug!(authority = %authority, remote = %remote, "TCP connection opened");

        let id = self.ids.next();

        if !authority.secure() || !tls {
            proxy_metrics::record_upstream_connection("opened");
            let mut connection = Connection::new(id, authority.clone(), HttpVersion::Unknown);
            connection.local_address = Some(local);
            connection.remote_address = Some(remote);
            connection.timings = timings;
            copy_timings(metrics, &connection.timings);
            return Ok(RemoteConnectionResult {
                kind: RemoteConnectionResultType::Http11,
                connection: Arc::new(connection),
                stream,
            });
        }

        timings.ssl_negotiation_start = Some(Utc::now());
        let started = Instant::now();
        let config = self.tls.client_config(context)?;
        let connector = TlsConnector::from(config);
        let name = tls::server_name(authority.host_name())?;

        let tls_stream = match connector.connect(name, stream).await {
            Ok(s) => s,
            Err(e) => {
                proxy_metrics::observe_tls_handshake("failure", started.elapsed());
                return Err(ProxyError::tls(authority.host_name(), e));
            }
        };
        proxy_metrics::observe_tls_handshake("success", started.elapsed());
        timings.ssl_negotiation_end = Some(Utc::now());

        let (_, session) = tls_stream.get_ref();
        let alpn = session
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        let kind = match alpn.as_deref() {
            Some("h2") => RemoteConnectionResultType::Http2,
            _ => RemoteConnectionResultType::Http11,
        };
        let ssl_info = SslInfo {
            protocol_version: session.protocol_version().map(|v| format!("{:?}", v)),
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            negotiated_application_protocol: alpn.clone(),
            remote_certificate_der_length: session
                .peer_certificates()
                .and_then(|c| c.first())
                .map(|c| c.len()),
            client_certificate_sent: context.client_certificate.is_some(),
        };

        debug!(
            authority = %authority,
            alpn = ?alpn,
            "TLS connection established"
        );
        proxy_metrics::record_upstream_connection("opened");

        let version = match kind {
            RemoteConnectionResultType::Http2 => HttpVersion::Http2,
            RemoteConnectionResultType::Http11 => HttpVersion::Http11,
        };
        let mut connection = Connection::new(id, authority.clone(), version);
        connection.local_address = Some(local);
        connection.remote_address = Some(remote);
        connection.ssl_info = Some(ssl_info);
        connection.timings = timings;
        copy_timings(metrics, &connection.timings);

        Ok(RemoteConnectionResult {
            kind,
            connection: Arc::new(connection),
            stream: Box::new(tls_stream),
        })
    }
}

fn copy_timings(metrics: Option<&SharedMetrics>, timings: &ConnectionTimings) {
    if let Some(metrics) = metrics {
        metrics.update(|m| {
            m.dns_solve_start = timings.dns_solve_start;
            m.dns_solve_end = timings.dns_solve_end;
            m.tcp_connection_opening = timings.tcp_connection_opening;
            m.tcp_connection_opened = timings.tcp_connection_opened;
            m.ssl_negotiation_start = timings.ssl_negotiation_start;
            m.ssl_negotiation_end = timings.ssl_negotiation_end;
        });
    }
}
