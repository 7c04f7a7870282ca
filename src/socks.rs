use crate::{
    error::{Error, Result},
    proxy_handler::{ProxyConnector, ProxyCounters, ProxyStats},
};
use socks5_impl::protocol::{self, Address, AsyncStreamOperation, AuthMethod, Command, Reply, handshake};
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// How long an upstream that failed to connect is reported unhealthy.
const RETRY_AFTER: Duration = Duration::from_secs(5);

/// IPv4 literals travel in binary form, anything else as a domain name.
pub fn target_address(host: &str, port: u16) -> Address {
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => Address::from(SocketAddr::V4(SocketAddrV4::new(ip, port))),
        Err(_) => Address::from((host.to_string(), port)),
    }
}

/// Runs the client side of a no-auth SOCKS5 CONNECT on `stream`.
///
/// On success the stream is positioned at the first relayed byte.
pub async fn client_handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    handshake::Request::new(vec![AuthMethod::NoAuth])
        .write_to_async_stream(stream)
        .await?;
    let response = handshake::Response::retrieve_from_async_stream(stream).await?;
    if response.method != AuthMethod::NoAuth {
        return Err(Error::Socks(format!("server selected unsupported method {:?}", response.method)));
    }

    protocol::Request::new(Command::Connect, target_address(host, port))
        .write_to_async_stream(stream)
        .await?;
    let response = protocol::Response::retrieve_from_async_stream(stream).await?;
    if response.reply != Reply::Succeeded {
        return Err(Error::Socks(format!(
            "connect to {host}:{port} rejected with {} ({:#04x})",
            response.reply,
            u8::from(response.reply)
        )));
    }
    log::trace!("SOCKS5 connect to {host}:{port} bound at {}", response.address);
    Ok(())
}

/// A SOCKS5 server reached over plain TCP, used as a [`ProxyConnector`].
///
/// Reported unhealthy for a short while after a failed connect, so the
/// router falls back to another connector.
#[derive(Debug)]
pub struct Socks5Upstream {
    server: SocketAddr,
    counters: ProxyCounters,
    failed_at: Mutex<Option<Instant>>,
}

impl Socks5Upstream {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            counters: ProxyCounters::default(),
            failed_at: Mutex::new(None),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    fn set_failed(&self, failed: bool) {
        *self.failed_at.lock().unwrap_or_else(PoisonError::into_inner) = failed.then(Instant::now);
    }
}

#[async_trait::async_trait]
impl ProxyConnector for Socks5Upstream {
    fn proxy_type(&self) -> &str {
        "SOCKS5"
    }

    fn is_healthy(&self) -> bool {
        let failed_at = *self.failed_at.lock().unwrap_or_else(PoisonError::into_inner);
        failed_at.is_none_or(|at| at.elapsed() >= RETRY_AFTER)
    }

    fn stats(&self) -> ProxyStats {
        self.counters.snapshot()
    }

    async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        let start = Instant::now();
        self.counters.record_connection();
        let result = async {
            let mut stream = TcpStream::connect(self.server).await?;
            stream.set_nodelay(true).ok();
            client_handshake(&mut stream, host, port).await?;
            Ok::<_, Error>(stream)
        }
        .await;
        match result {
            Ok(stream) => {
                self.counters.record_response_time(start.elapsed());
                self.set_failed(false);
                Ok(stream)
            }
            Err(err) => {
                self.counters.record_error();
                self.set_failed(true);
                Err(err.into())
            }
        }
    }
}
