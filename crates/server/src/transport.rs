//! Byte transports under the connection channel

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// For logs and stats
    fn name(&self) -> &str;

    /// Whether a lost connection can be dialed again
    fn reconnectable(&self) -> bool;

    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)>;
}

/// The process's own stdin/stdout. EOF is the end of the session.
#[derive(Debug, Default)]
pub struct StdioTransport;

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &str {
        "stdio"
    }

    fn reconnectable(&self) -> bool {
        false
    }

    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        Ok((Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout())))
    }
}

/// Dials out to a client listening on `host:port`
#[derive(Debug)]
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.address
    }

    fn reconnectable(&self) -> bool {
        true
    }

    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.address),
                )
            })??;
        stream.set_nodelay(true)?;
        debug!(address = %self.address, "tcp transport connected");
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// An already-open pair of streams, handed out once
pub struct StreamTransport {
    streams: Mutex<Option<(BoxedReader, BoxedWriter)>>,
}

impl StreamTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            streams: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn name(&self) -> &str {
        "stream"
    }

    fn reconnectable(&self) -> bool {
        false
    }

    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        self.streams.lock().await.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "stream transport already used")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let transport = TcpTransport::new(address, Duration::from_secs(1));
        assert!(transport.reconnectable());
        let (_reader, mut writer) = transport.connect().await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_stream_transport_is_single_use() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let (reader, writer) = tokio::io::split(server);
        let transport = StreamTransport::new(reader, writer);
        assert!(transport.connect().await.is_ok());
        let err = transport.connect().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
