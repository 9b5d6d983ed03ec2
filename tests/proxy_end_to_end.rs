// Proxy End-to-End Tests
// Real client sockets through a running proxy to loopback origins

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fluxgate::certificate::CertificateProvider;
use fluxgate::establish::tls::downstream_server_config;
use fluxgate::rules::{
    AnyFilter, ForwardAction, HostFilter, Rule, SkipSslTunnelingAction, StringSelector,
};
use fluxgate::{CertificateAuthority, Proxy, ProxyRuntimeBuilder, ProxySettings};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const CONNECT_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-length: 0\r\nConnection: keep-alive\r\n\r\n";

fn settings() -> ProxySettings {
    let mut settings = ProxySettings::default();
    settings.bound_points = vec!["127.0.0.1:0".parse().unwrap()];
    settings.shutdown_retry_budget = 20;
    settings.shutdown_poll_interval_ms = 10;
    settings
}

async fn start(builder: ProxyRuntimeBuilder) -> (Proxy, SocketAddr) {
    let mut proxy = Proxy::new(builder.build().unwrap());
    let endpoints = proxy.start().await.unwrap();
    (proxy, endpoints[0])
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Requests seen by an origin and the number of connections it accepted
#[derive(Default)]
struct OriginLog {
    heads: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

impl OriginLog {
    fn heads(&self) -> Vec<String> {
        self.heads.lock().unwrap().clone()
    }
}

/// Answer every request on `socket` with its request target as body
async fn serve_origin<S>(mut socket: S, log: Arc<OriginLog>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let end = loop {
            if let Some(end) = find_header_end(&buf) {
                break end;
            }
            let mut chunk = [0u8; 1024];
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..end]).into_owned();
        buf.drain(..end);
        let target = head.split(' ').nth(1).unwrap_or("/").to_string();
        log.heads.lock().unwrap().push(head);

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            target.len(),
            target
        );
        if socket.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn spawn_origin() -> (SocketAddr, Arc<OriginLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(OriginLog::default());
    let origin_log = log.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            origin_log.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_origin(socket, origin_log.clone()));
        }
    });
    (addr, log)
}

async fn spawn_tls_origin(ca: &CertificateAuthority) -> (SocketAddr, Arc<OriginLog>) {
    let leaf = ca.get_certificate("127.0.0.1").await.unwrap();
    let acceptor = TlsAcceptor::from(downstream_server_config(&leaf).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(OriginLog::default());
    let origin_log = log.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            origin_log.connections.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let log = origin_log.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(socket).await {
                    serve_origin(tls, log).await;
                }
            });
        }
    });
    (addr, log)
}

/// Parsed response read off a client connection
struct ClientResponse {
    head: String,
    body: Vec<u8>,
}

impl ClientResponse {
    fn status(&self) -> u16 {
        self.head
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn header(&self, name: &str) -> Option<String> {
        self.head.lines().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    }
}

/// Reads Content-Length framed responses, keeping bytes of the next one
struct ResponseReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + Unpin> ResponseReader<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed early");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    async fn next(&mut self) -> ClientResponse {
        let end = loop {
            if let Some(end) = find_header_end(&self.buf) {
                break end;
            }
            self.fill().await;
        };
        let head = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.drain(..end);

        let mut response = ClientResponse {
            head,
            body: Vec::new(),
        };
        let length: usize = response
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while self.buf.len() < length {
            self.fill().await;
        }
        response.body = self.buf.drain(..length).collect();
        response
    }
}

async fn with_timeout<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_connect_acknowledged_before_handshake() {
    let (proxy, addr) = start(ProxyRuntimeBuilder::new(settings())).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut reply = vec![0u8; CONNECT_REPLY.len()];
    with_timeout(client.read_exact(&mut reply)).await.unwrap();
    assert_eq!(reply, CONNECT_REPLY);

    drop(client);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_blind_tunnel_generates_no_certificate() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let (mut reader, mut writer) = socket.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let ca = Arc::new(CertificateAuthority::generate(8).unwrap());
    let builder = ProxyRuntimeBuilder::new(settings())
        .certificates(ca.clone())
        .rule(Rule::new(
            HostFilter::new(StringSelector::exact("127.0.0.1")),
            SkipSslTunnelingAction,
        ));
    let (proxy, addr) = start(builder).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", echo_addr).as_bytes())
        .await
        .unwrap();
    let mut reply = vec![0u8; CONNECT_REPLY.len()];
    with_timeout(client.read_exact(&mut reply)).await.unwrap();
    assert_eq!(reply, CONNECT_REPLY);

    client.write_all(b"not even tls").await.unwrap();
    let mut echoed = [0u8; 12];
    with_timeout(client.read_exact(&mut echoed)).await.unwrap();
    assert_eq!(&echoed, b"not even tls");
    assert_eq!(ca.generated(), 0);

    drop(client);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_pipelined_requests_over_intercepted_connection() {
    let upstream_ca = CertificateAuthority::generate(8).unwrap();
    let (origin, log) = spawn_tls_origin(&upstream_ca).await;

    let proxy_ca = Arc::new(CertificateAuthority::generate(8).unwrap());
    let builder = ProxyRuntimeBuilder::new(settings())
        .certificates(proxy_ca.clone())
        .trust_root(upstream_ca.ca_der().clone());
    let (proxy, addr) = start(builder).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", origin).as_bytes())
        .await
        .unwrap();
    let mut reply = vec![0u8; CONNECT_REPLY.len()];
    with_timeout(client.read_exact(&mut reply)).await.unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(proxy_ca.ca_der().clone()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = with_timeout(connector.connect(server_name, client))
        .await
        .unwrap();

    // Both requests in a single write
    let requests = format!(
        "GET /one HTTP/1.1\r\nHost: {0}\r\n\r\nGET /two HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
        origin
    );
    tls.write_all(requests.as_bytes()).await.unwrap();
    tls.flush().await.unwrap();

    let mut responses = ResponseReader::new(tls);
    let first = with_timeout(responses.next()).await;
    let second = with_timeout(responses.next()).await;
    assert_eq!(first.status(), 200);
    assert_eq!(first.body, b"/one");
    assert_eq!(second.body, b"/two");

    let heads = log.heads();
    assert_eq!(heads.len(), 2);
    assert!(heads[0].starts_with("GET /one HTTP/1.1\r\n"));
    assert!(heads[1].starts_with("GET /two HTTP/1.1\r\n"));
    assert!(!heads[1].to_ascii_lowercase().contains("connection: close"));
    assert_eq!(proxy_ca.generated(), 1);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_plain_requests_reuse_upstream_connection() {
    let (origin, log) = spawn_origin().await;
    let (proxy, addr) = start(ProxyRuntimeBuilder::new(settings())).await;

    let client = TcpStream::connect(addr).await.unwrap();
    let mut responses = ResponseReader::new(client);

    responses
        .stream
        .write_all(format!("GET http://{}/a HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
        .await
        .unwrap();
    let first = with_timeout(responses.next()).await;
    assert_eq!(first.body, b"/a");

    // Give the pool time to take the connection back
    tokio::time::sleep(Duration::from_millis(100)).await;

    responses
        .stream
        .write_all(format!("GET http://{}/b HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
        .await
        .unwrap();
    let second = with_timeout(responses.next()).await;
    assert_eq!(second.body, b"/b");

    assert_eq!(log.connections.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.runtime().pools.pools_created(), 1);

    drop(responses);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_forward_rule_rewrites_target() {
    let (origin, log) = spawn_origin().await;
    let forward = ForwardAction::new(&format!("http://{}/api", origin)).unwrap();
    let builder = ProxyRuntimeBuilder::new(settings()).rule(Rule::new(AnyFilter, forward));
    let (proxy, addr) = start(builder).await;

    let client = TcpStream::connect(addr).await.unwrap();
    let mut responses = ResponseReader::new(client);
    responses
        .stream
        .write_all(b"GET http://original.test/users HTTP/1.1\r\nHost: original.test\r\n\r\n")
        .await
        .unwrap();
    let response = with_timeout(responses.next()).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.body, b"/api/users");
    assert!(log.heads()[0].starts_with("GET /api/users HTTP/1.1\r\n"));

    drop(responses);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_rule_file_mocked_response() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.yaml");
    std::fs::write(
        &path,
        "rules:\n  - filter: { type: host, pattern: mocked.test }\n    action: { type: mocked_response, status: 418, body: teapot, headers: [{ name: X-Mock, value: yes }] }\n",
    )
    .unwrap();

    let mut settings = settings();
    settings.rules_file = Some(path);
    let (proxy, addr) = start(ProxyRuntimeBuilder::new(settings)).await;

    let client = TcpStream::connect(addr).await.unwrap();
    let mut responses = ResponseReader::new(client);
    responses
        .stream
        .write_all(b"GET http://mocked.test/anything HTTP/1.1\r\nHost: mocked.test\r\n\r\n")
        .await
        .unwrap();
    let response = with_timeout(responses.next()).await;
    assert_eq!(response.status(), 418);
    assert_eq!(response.body, b"teapot");
    assert_eq!(response.header("x-mock").as_deref(), Some("yes"));

    drop(responses);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_proxy_serves_its_ca_certificate() {
    let (proxy, addr) = start(ProxyRuntimeBuilder::new(settings())).await;

    let client = TcpStream::connect(addr).await.unwrap();
    let mut responses = ResponseReader::new(client);
    responses
        .stream
        .write_all(b"GET / HTTP/1.1\r\nHost: fluxgate\r\n\r\n")
        .await
        .unwrap();
    let response = with_timeout(responses.next()).await;
    assert_eq!(response.status(), 200);
    assert!(response.body.starts_with(b"-----BEGIN CERTIFICATE-----"));
    assert_eq!(
        response.header("content-type").as_deref(),
        Some("application/x-pem-file")
    );

    drop(responses);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_remote_gets_error_status() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.local_addr().unwrap();
    drop(closed);

    let mut settings = settings();
    settings.error_status_code = 528;
    let (proxy, addr) = start(ProxyRuntimeBuilder::new(settings)).await;

    let client = TcpStream::connect(addr).await.unwrap();
    let mut responses = ResponseReader::new(client);
    responses
        .stream
        .write_all(format!("GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
        .await
        .unwrap();
    let response = with_timeout(responses.next()).await;
    assert_eq!(response.status(), 528);
    assert!(response.header("x-fluxgate-error").is_some());
    assert_eq!(response.header("connection").as_deref(), Some("close"));

    drop(responses);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_websocket_upgrade_is_spliced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        while find_header_end(&buf).is_none() {
            let mut chunk = [0u8; 1024];
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8_lossy(&buf).to_ascii_lowercase();
        assert!(head.contains("upgrade: websocket"));
        socket
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        let (mut reader, mut writer) = socket.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let (proxy, addr) = start(ProxyRuntimeBuilder::new(settings())).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://{0}/chat HTTP/1.1\r\nHost: {0}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
                origin
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    while find_header_end(&head).is_none() {
        let mut byte = [0u8; 1];
        with_timeout(client.read_exact(&mut byte)).await.unwrap();
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101 "));

    client.write_all(b"\x81\x02hi").await.unwrap();
    let mut frame = [0u8; 4];
    with_timeout(client.read_exact(&mut frame)).await.unwrap();
    assert_eq!(&frame, b"\x81\x02hi");

    drop(client);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_exchange_limit_stops_proxy() {
    let mut settings = settings();
    settings.max_exchange_count = Some(1);
    let (proxy, addr) = start(ProxyRuntimeBuilder::new(settings)).await;
    let stopped = proxy.shutdown_token();

    let client = TcpStream::connect(addr).await.unwrap();
    let mut responses = ResponseReader::new(client);
    responses
        .stream
        .write_all(b"GET / HTTP/1.1\r\nHost: fluxgate\r\n\r\n")
        .await
        .unwrap();
    with_timeout(responses.next()).await;
    with_timeout(stopped.cancelled()).await;

    proxy.shutdown().await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_closes_idle_client_connections() {
    let (origin, _log) = spawn_origin().await;
    let (proxy, addr) = start(ProxyRuntimeBuilder::new(settings())).await;

    let client = TcpStream::connect(addr).await.unwrap();
    let mut responses = ResponseReader::new(client);
    responses
        .stream
        .write_all(format!("GET http://{}/idle HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
        .await
        .unwrap();
    let response = with_timeout(responses.next()).await;
    assert_eq!(response.body, b"/idle");

    // Keep-alive connection now waits for a next request
    with_timeout(proxy.shutdown()).await;
    assert!(TcpStream::connect(addr).await.is_err());

    let mut rest = Vec::new();
    let read = with_timeout(responses.stream.read_to_end(&mut rest)).await;
    assert!(read.is_err() || rest.is_empty());
}
