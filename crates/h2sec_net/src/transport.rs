use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};

/// Byte stream the frame codec runs over, plain TCP or TLS alike.
pub type BoxedStream = Box<dyn RawStream>;

pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

pub struct TransportBuilder;

impl TransportBuilder {
    /// Resolves `host:port`, taking the first address returned.
    pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
        tokio::net::lookup_host((host, port))
            .await
            .with_context(|| format!("failed to resolve {}:{}", host, port))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("no address found for {}:{}", host, port))
    }

    /// Opens a TCP connection with the socket configured before connecting.
    ///
    /// Nagle is disabled: checks depend on every frame leaving the client as
    /// soon as it is written, not coalesced with the next one.
    pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        // Required before handing the socket to tokio.
        socket.set_nonblocking(true)?;

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpSocket::from_std_stream(std_stream)
            .connect(addr)
            .await
            .with_context(|| format!("failed to connect to {}", addr))?;

        Ok(stream)
    }

    pub fn into_boxed<S>(stream: S) -> BoxedStream
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Box::new(stream)
    }
}
