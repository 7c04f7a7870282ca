use std::{io, net::SocketAddr};
use tokio::net::{TcpSocket, TcpStream};

/// The physical network outbound sockets must leave through, so that
/// traffic generated by the proxy is not captured by the tun device again.
#[async_trait::async_trait]
pub trait UnderlyingNetwork: Send + Sync + std::fmt::Debug {
    /// Prepares an unconnected socket before `connect` is called on it.
    fn protect(&self, socket: &TcpSocket) -> io::Result<()>;

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        self.protect(&socket)?;
        socket.connect(addr).await
    }
}

/// Uses the routing table as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNetwork;

impl UnderlyingNetwork for SystemNetwork {
    fn protect(&self, _socket: &TcpSocket) -> io::Result<()> {
        Ok(())
    }
}

/// Pins sockets to a named interface such as `eth0` or `wlan0`.
#[derive(Debug, Clone)]
pub struct BoundInterface {
    name: String,
}

impl BoundInterface {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl UnderlyingNetwork for BoundInterface {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn protect(&self, socket: &TcpSocket) -> io::Result<()> {
        socket.bind_device(Some(self.name.as_bytes()))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn protect(&self, _socket: &TcpSocket) -> io::Result<()> {
        log::trace!("Binding to interface {} is not supported on this platform", self.name);
        Ok(())
    }
}

/// Resolves `host` and connects to the first address that accepts.
pub async fn connect_host(network: &dyn UnderlyingNetwork, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        match network.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                log::trace!("Connect to {addr} failed: {err}");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))))
}
