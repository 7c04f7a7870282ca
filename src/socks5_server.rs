use crate::{
    error::{Error, Result},
    network::{UnderlyingNetwork, connect_host},
    proxy_handler::{ProxyConnector, ProxyCounters, ProxyStats},
    socks::Socks5Upstream,
};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LISTEN_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 1080);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RELAY_BUFFER_SIZE: usize = 4096;

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SocksAddressType {
    Ipv4 = 1,
    DomainName = 3,
}

impl TryFrom<u8> for SocksAddressType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            1 => Ok(SocksAddressType::Ipv4),
            3 => Ok(SocksAddressType::DomainName),
            other => Err(other),
        }
    }
}

#[allow(dead_code)]
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SocksReply {
    Succeeded = 0,
    GeneralFailure = 1,
    ConnectionDisallowed = 2,
    NetworkUnreachable = 3,
    HostUnreachable = 4,
    ConnectionRefused = 5,
    TtlExpired = 6,
    CommandUnsupported = 7,
    AddressUnsupported = 8,
}

impl SocksReply {
    /// Reply for a failed outbound connect.
    fn from_connect_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => SocksReply::ConnectionRefused,
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => SocksReply::NetworkUnreachable,
            io::ErrorKind::TimedOut => SocksReply::HostUnreachable,
            _ => SocksReply::GeneralFailure,
        }
    }

    /// The reply frame with an all-zero IPv4 bound address.
    fn frame(self) -> [u8; 10] {
        [SOCKS_VERSION, self as u8, 0, SocksAddressType::Ipv4 as u8, 0, 0, 0, 0, 0, 0]
    }
}

impl std::fmt::Display for SocksReply {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A no-auth SOCKS5 CONNECT server on a loopback port.
///
/// Outbound target sockets go through the configured [`UnderlyingNetwork`].
#[derive(Debug)]
pub struct Socks5Server {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    network: Arc<dyn UnderlyingNetwork>,
    connect_timeout: Duration,
    running: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    counters: ProxyCounters,
}

impl Socks5Server {
    /// Binds the listener. A bind failure is a startup failure for the caller.
    pub async fn bind(listen: SocketAddr, network: Arc<dyn UnderlyingNetwork>, connect_timeout: Duration) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        log::info!("SOCKS5 server listening on {local_addr}");
        Ok(Arc::new(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            network,
            connect_timeout,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            counters: ProxyCounters::default(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop. It ends when `shutdown` fires or [`stop`](Self::stop) is called.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::from("SOCKS5 server already started"))?;
        self.running.store(true, Ordering::SeqCst);
        let server = self.clone();
        Ok(tokio::spawn(async move { server.accept_loop(listener, shutdown).await }))
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// A connector that reaches this server as a SOCKS5 client.
    pub fn client(&self) -> Socks5Upstream {
        Socks5Upstream::new(self.local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        let server = self.clone();
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => log::trace!("SOCKS5 client {peer} cancelled"),
                                _ = server.shutdown.cancelled() => log::trace!("SOCKS5 client {peer} cancelled"),
                                _ = server.handle_client(client, peer) => {}
                            }
                        });
                    }
                    Err(err) => {
                        log::warn!("SOCKS5 accept error: {err}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        log::info!("SOCKS5 server on {} stopped", self.local_addr);
    }

    async fn handle_client(&self, mut client: TcpStream, peer: SocketAddr) {
        let start = Instant::now();
        self.counters.record_connection();
        log::debug!("SOCKS5 client {peer} connected");

        let negotiated = tokio::time::timeout(self.connect_timeout, self.negotiate(&mut client))
            .await
            .unwrap_or_else(|elapsed| Err(Error::from(elapsed)));
        let target = match negotiated {
            Ok(Some(target)) => target,
            Ok(None) => return,
            Err(err) => {
                log::debug!("SOCKS5 client {peer} negotiation failed: {err}");
                self.counters.record_error();
                return;
            }
        };

        let (host, port) = target;
        let connected = tokio::time::timeout(self.connect_timeout, connect_host(self.network.as_ref(), &host, port))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")));
        let remote = match connected {
            Ok(remote) => remote,
            Err(err) => {
                let reply = SocksReply::from_connect_error(&err);
                log::debug!("SOCKS5 connect to {host}:{port} failed: {err} ({reply})");
                self.counters.record_error();
                let _ = client.write_all(&reply.frame()).await;
                return;
            }
        };
        if let Err(err) = client.write_all(&SocksReply::Succeeded.frame()).await {
            log::debug!("SOCKS5 client {peer} went away: {err}");
            self.counters.record_error();
            return;
        }
        self.counters.record_response_time(start.elapsed());
        log::debug!("SOCKS5 {peer} -> {host}:{port} connected");

        remote.set_nodelay(true).ok();
        let (client_read, client_write) = client.into_split();
        let (remote_read, remote_write) = remote.into_split();
        let (up, down) = tokio::join!(
            self.copy_half(client_read, remote_write, "client -> target"),
            self.copy_half(remote_read, client_write, "target -> client"),
        );
        log::debug!("SOCKS5 {peer} -> {host}:{port} closed, {up} bytes up, {down} bytes down");
    }

    /// Greeting and request. `Ok(None)` means an error reply was already sent.
    async fn negotiate(&self, client: &mut TcpStream) -> Result<Option<(String, u16)>> {
        let mut greeting = [0u8; 3];
        client.read_exact(&mut greeting).await?;
        let [version, method_count, _] = greeting;
        if version != SOCKS_VERSION || method_count == 0 {
            return Err(Error::Socks(format!("bad greeting {greeting:02x?}")));
        }
        if method_count > 1 {
            let mut extra = vec![0u8; method_count as usize - 1];
            client.read_exact(&mut extra).await?;
        }
        client.write_all(&[SOCKS_VERSION, 0x00]).await?;

        let mut header = [0u8; 4];
        client.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION || header[1] != CMD_CONNECT {
            log::debug!("SOCKS5 unsupported request {header:02x?}");
            client.write_all(&SocksReply::CommandUnsupported.frame()).await?;
            return Ok(None);
        }
        let host = match SocksAddressType::try_from(header[3]) {
            Ok(SocksAddressType::Ipv4) => {
                let mut ip = [0u8; 4];
                client.read_exact(&mut ip).await?;
                Ipv4Addr::from(ip).to_string()
            }
            Ok(SocksAddressType::DomainName) => {
                let len = client.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                client.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).into_owned()
            }
            Err(atyp) => {
                log::debug!("SOCKS5 unsupported address type {atyp:#04x}");
                client.write_all(&SocksReply::AddressUnsupported.frame()).await?;
                return Ok(None);
            }
        };
        let port = client.read_u16().await?;
        Ok(Some((host, port)))
    }

    async fn copy_half(&self, mut from: OwnedReadHalf, mut to: OwnedWriteHalf, direction: &str) -> u64 {
        let mut buf = [0u8; RELAY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            match from.read(&mut buf).await {
                Ok(0) => {
                    let _ = to.shutdown().await;
                    break;
                }
                Ok(n) => {
                    if let Err(err) = to.write_all(&buf[..n]).await {
                        log::trace!("SOCKS5 relay {direction} write error: {err}");
                        break;
                    }
                    total += n as u64;
                    self.counters.record_bytes(n);
                }
                Err(err) => {
                    log::trace!("SOCKS5 relay {direction} read error: {err}");
                    break;
                }
            }
        }
        total
    }
}

#[async_trait::async_trait]
impl ProxyConnector for Socks5Server {
    fn proxy_type(&self) -> &str {
        "SOCKS5"
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ProxyStats {
        self.counters.snapshot()
    }

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        self.client().connect(host, port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_map_to_replies() {
        let reply = |kind| SocksReply::from_connect_error(&io::Error::from(kind)) as u8;
        assert_eq!(reply(io::ErrorKind::ConnectionRefused), 0x05);
        assert_eq!(reply(io::ErrorKind::NetworkUnreachable), 0x03);
        assert_eq!(reply(io::ErrorKind::HostUnreachable), 0x03);
        assert_eq!(reply(io::ErrorKind::TimedOut), 0x04);
        assert_eq!(reply(io::ErrorKind::PermissionDenied), 0x01);
    }

    #[test]
    fn reply_frames() {
        assert_eq!(SocksReply::Succeeded.frame(), [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(SocksReply::CommandUnsupported.frame()[1], 0x07);
        assert_eq!(SocksReply::AddressUnsupported.frame()[1], 0x08);
    }
}
