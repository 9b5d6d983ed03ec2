//! TCP connection factory

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::stream::BoxedStream;

/// A connection not yet opened
#[async_trait]
pub trait TcpConnection: Send {
    /// Connect and return the local endpoint
    async fn connect(&mut self, remote: SocketAddr) -> io::Result<SocketAddr>;

    /// Stream of an opened connection
    fn into_stream(self: Box<Self>) -> io::Result<BoxedStream>;
}

pub trait TcpConnectionProvider: Send + Sync {
    /// `label` identifies the target for providers that record traffic
    fn create(&self, label: &str) -> Box<dyn TcpConnection>;
}

/// Plain tokio sockets with TCP_NODELAY
#[derive(Debug, Clone)]
pub struct DefaultTcpConnectionProvider {
    connect_timeout: Duration,
}

impl DefaultTcpConnectionProvider {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DefaultTcpConnectionProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TcpConnectionProvider for DefaultTcpConnectionProvider {
    fn create(&self, _label: &str) -> Box<dyn TcpConnection> {
        Box::new(DefaultTcpConnection {
            stream: None,
            connect_timeout: self.connect_timeout,
        })
    }
}

struct DefaultTcpConnection {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
}

#[async_trait]
impl TcpConnection for DefaultTcpConnection {
    async fn connect(&mut self, remote: SocketAddr) -> io::Result<SocketAddr> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        self.stream = Some(stream);
        Ok(local)
    }

    fn into_stream(self: Box<Self>) -> io::Result<BoxedStream> {
        self.stream
            .map(|s| Box::new(s) as BoxedStream)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connect was not called"))
    }
}
